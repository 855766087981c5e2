//! Fragment-to-action reassembly.

use std::collections::HashMap;

use starling_types::{ActionType, MemberId, View};
use starling_wire::FragmentHeader;

/// Outcome of ingesting one transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Fragment consumed; the action is still incomplete.
    Buffered,
    /// The final fragment arrived; the action is fully assembled.
    Complete {
        act_id: u64,
        act_type: ActionType,
        payload: Vec<u8>,
    },
    /// Reassembly failed; the source's open slot (if any) was dropped.
    Failed { act_id: u64, reason: String },
}

#[derive(Debug)]
struct Slot {
    act_id: u64,
    act_type: ActionType,
    declared: u32,
    expected_frag: u32,
    buf: Vec<u8>,
}

/// Per-source fragment reassembly.
///
/// Sources emit the fragments of one action contiguously and in order, so at
/// most one slot per source is ever open. Slots are dropped on completion,
/// on failure, and when their source leaves the configuration.
#[derive(Debug)]
pub struct Defrag {
    max_action_size: usize,
    slots: HashMap<MemberId, Slot>,
}

impl Defrag {
    pub fn new(max_action_size: usize) -> Self {
        Self {
            max_action_size,
            slots: HashMap::new(),
        }
    }

    /// Ingest one raw transport message from `source`.
    pub fn ingest(&mut self, source: &MemberId, bytes: &[u8]) -> Ingest {
        let (header, body) = match FragmentHeader::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.slots.remove(source);
                return Ingest::Failed {
                    act_id: 0,
                    reason: format!("undecodable fragment from {source}: {e}"),
                };
            }
        };

        if let Some(slot) = self.slots.get_mut(source) {
            if slot.act_id != header.act_id || header.frag_no != slot.expected_frag {
                let act_id = slot.act_id;
                let expected = slot.expected_frag;
                self.slots.remove(source);
                return Ingest::Failed {
                    act_id,
                    reason: format!(
                        "fragment sequence violation from {source}: \
                         expected frag {expected} of action {act_id}, \
                         got frag {} of action {}",
                        header.frag_no, header.act_id
                    ),
                };
            }
        } else {
            if header.frag_no != 0 {
                return Ingest::Failed {
                    act_id: header.act_id,
                    reason: format!(
                        "fragment sequence violation from {source}: \
                         action {} starts at frag {}",
                        header.act_id, header.frag_no
                    ),
                };
            }
            if header.act_size as usize > self.max_action_size {
                return Ingest::Failed {
                    act_id: header.act_id,
                    reason: format!(
                        "action {} from {source} declares {} bytes, cap is {}",
                        header.act_id, header.act_size, self.max_action_size
                    ),
                };
            }
            // Preallocation is capped: the declared size is untrusted input.
            let reserve = (header.act_size as usize).min(1 << 20);
            self.slots.insert(
                source.clone(),
                Slot {
                    act_id: header.act_id,
                    act_type: header.act_type,
                    declared: header.act_size,
                    expected_frag: 0,
                    buf: Vec::with_capacity(reserve),
                },
            );
        }

        let slot = self.slots.get_mut(source).expect("slot checked or inserted above");
        slot.buf.extend_from_slice(body);
        slot.expected_frag += 1;

        if slot.buf.len() > slot.declared as usize {
            let act_id = slot.act_id;
            let got = slot.buf.len();
            let declared = slot.declared;
            self.slots.remove(source);
            return Ingest::Failed {
                act_id,
                reason: format!(
                    "action {act_id} from {source} overran its declared size: \
                     {got} > {declared}"
                ),
            };
        }

        if header.more {
            return Ingest::Buffered;
        }

        let slot = self.slots.remove(source).expect("slot inserted above");
        if slot.buf.len() != slot.declared as usize {
            return Ingest::Failed {
                act_id: slot.act_id,
                reason: format!(
                    "action {} from {source} ended short: {} of {} bytes",
                    slot.act_id,
                    slot.buf.len(),
                    slot.declared
                ),
            };
        }
        Ingest::Complete {
            act_id: slot.act_id,
            act_type: slot.act_type,
            payload: slot.buf,
        }
    }

    /// Drop partial buffers of sources that left the configuration.
    pub fn retain_members(&mut self, view: &View) {
        self.slots.retain(|source, _| view.members.contains(source));
    }

    /// Drop every partial buffer (non-primary transition).
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of open assembly slots.
    pub fn open_slots(&self) -> usize {
        self.slots.len()
    }
}
