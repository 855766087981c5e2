//! Fragment header layout and action fragmentation.

use starling_types::ActionType;

use crate::WireError;

/// Serialized fragment header length in bytes.
///
/// Layout (little-endian):
///
/// ```text
/// act_id   u64   per-connection action counter, repl-wait tag
/// act_size u32   total declared action size
/// frag_no  u32   0-based fragment ordinal within the action
/// act_type u8
/// flags    u8    bit 0: MORE (another fragment follows)
/// ```
pub const FRAG_HEADER_LEN: usize = 18;

/// Smallest packet size that leaves room for at least one payload byte.
pub const MIN_PKT_SIZE: usize = FRAG_HEADER_LEN + 1;

const FLAG_MORE: u8 = 0x01;

/// Header carried in front of every transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Per-connection monotonically increasing action id. Doubles as the tag
    /// matching self-delivered actions against the repl wait table.
    pub act_id: u64,
    /// Total size of the action this fragment belongs to.
    pub act_size: u32,
    /// 0-based fragment ordinal; fragments of one action are contiguous on
    /// the wire from their source.
    pub frag_no: u32,
    /// Action type.
    pub act_type: ActionType,
    /// Whether another fragment follows.
    pub more: bool,
}

impl FragmentHeader {
    /// Encode into the fixed 18-byte layout.
    pub fn encode(&self) -> [u8; FRAG_HEADER_LEN] {
        let mut buf = [0u8; FRAG_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.act_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.act_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.frag_no.to_le_bytes());
        buf[16] = self.act_type.to_u8();
        buf[17] = if self.more { FLAG_MORE } else { 0 };
        buf
    }

    /// Decode a header and return it with the remaining payload bytes.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if buf.len() < FRAG_HEADER_LEN {
            return Err(WireError::Truncated {
                need: FRAG_HEADER_LEN,
                got: buf.len(),
            });
        }
        let header = FragmentHeader {
            act_id: u64::from_le_bytes(buf[0..8].try_into().expect("slice length checked")),
            act_size: u32::from_le_bytes(buf[8..12].try_into().expect("slice length checked")),
            frag_no: u32::from_le_bytes(buf[12..16].try_into().expect("slice length checked")),
            act_type: ActionType::from_u8(buf[16]),
            more: buf[17] & FLAG_MORE != 0,
        };
        Ok((header, &buf[FRAG_HEADER_LEN..]))
    }
}

/// Split an action into transport messages of at most `pkt_size` bytes.
///
/// Every message starts with a [`FragmentHeader`]; the last one has
/// `more == false`. An empty action still produces a single header-only
/// message so the receiver observes it.
pub fn fragment_action(
    act_id: u64,
    act_type: ActionType,
    payload: &[u8],
    pkt_size: usize,
) -> Result<Vec<Vec<u8>>, WireError> {
    if pkt_size < MIN_PKT_SIZE {
        return Err(WireError::PktSizeTooSmall {
            min: MIN_PKT_SIZE,
            got: pkt_size,
        });
    }
    let chunk = pkt_size - FRAG_HEADER_LEN;
    let act_size = payload.len() as u32;

    let nfrags = payload.len().div_ceil(chunk).max(1);
    let mut frames = Vec::with_capacity(nfrags);
    for frag_no in 0..nfrags {
        let lo = frag_no * chunk;
        let hi = (lo + chunk).min(payload.len());
        let header = FragmentHeader {
            act_id,
            act_size,
            frag_no: frag_no as u32,
            act_type,
            more: frag_no + 1 < nfrags,
        };
        let mut frame = Vec::with_capacity(FRAG_HEADER_LEN + (hi - lo));
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload[lo..hi]);
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn reassemble(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let (header, body) = FragmentHeader::decode(frame).unwrap();
            assert_eq!(header.frag_no as usize, i);
            assert_eq!(header.more, i + 1 < frames.len());
            out.extend_from_slice(body);
        }
        out
    }

    #[test]
    fn header_round_trip() {
        let header = FragmentHeader {
            act_id: 0xdead_beef_cafe,
            act_size: 250,
            frag_no: 3,
            act_type: ActionType::Data,
            more: true,
        };
        let bytes = header.encode();
        let (decoded, rest) = FragmentHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = FragmentHeader::decode(&[0u8; 5]).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                need: FRAG_HEADER_LEN,
                got: 5
            }
        );
    }

    #[test]
    fn empty_action_yields_one_final_fragment() {
        let frames = fragment_action(7, ActionType::Data, &[], 100).unwrap();
        assert_eq!(frames.len(), 1);
        let (header, body) = FragmentHeader::decode(&frames[0]).unwrap();
        assert!(!header.more);
        assert_eq!(header.act_size, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn fragments_respect_pkt_size() {
        let payload = vec![0xabu8; 250];
        let frames = fragment_action(1, ActionType::Data, &payload, 100).unwrap();
        // 100 - 18 = 82 payload bytes per frame -> ceil(250 / 82) = 4 frames.
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.len() <= 100));
        assert_eq!(reassemble(&frames), payload);
    }

    #[test]
    fn pkt_size_must_fit_header_and_a_byte() {
        assert!(matches!(
            fragment_action(1, ActionType::Data, b"x", FRAG_HEADER_LEN),
            Err(WireError::PktSizeTooSmall { .. })
        ));
    }

    /// Fragmenting then reassembling is the identity for sizes across the
    /// whole [0, 10 * pkt_size] range.
    #[test]
    fn round_trip_over_size_range() {
        let pkt_size = 64;
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for n in (0..=10 * pkt_size).step_by(7) {
            let payload: Vec<u8> = (0..n).map(|_| rng.gen()).collect();
            let frames = fragment_action(n as u64, ActionType::Data, &payload, pkt_size).unwrap();
            assert_eq!(reassemble(&frames), payload, "size {n}");
        }
    }
}
