//! Byte layouts of library-generated control actions.

use starling_types::{GroupUuid, MemberId, Seqno};

use crate::WireError;

fn read_i64(buf: &[u8], at: usize) -> Result<i64, WireError> {
    let end = at + 8;
    if buf.len() < end {
        return Err(WireError::Truncated {
            need: end,
            got: buf.len(),
        });
    }
    Ok(i64::from_le_bytes(
        buf[at..end].try_into().expect("slice length checked"),
    ))
}

fn read_i32(buf: &[u8], at: usize) -> Result<i32, WireError> {
    let end = at + 4;
    if buf.len() < end {
        return Err(WireError::Truncated {
            need: end,
            got: buf.len(),
        });
    }
    Ok(i32::from_le_bytes(
        buf[at..end].try_into().expect("slice length checked"),
    ))
}

/// Payload of a CONF action.
///
/// ```text
/// seqno       i64       last globally applied seqno as agreed by quorum
/// conf_id     i64       -1 for non-primary configurations
/// group_uuid  [u8; 16]
/// st_required u8
/// memb_num    i32
/// my_idx      i32
/// data        memb_num null-terminated member ids
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfPayload {
    pub seqno: Seqno,
    pub conf_id: i64,
    pub group_uuid: GroupUuid,
    pub st_required: bool,
    pub my_idx: i32,
    pub members: Vec<MemberId>,
}

impl ConfPayload {
    const FIXED_LEN: usize = 8 + 8 + GroupUuid::LEN + 1 + 4 + 4;

    /// Whether this configuration is primary.
    pub fn is_primary(&self) -> bool {
        self.conf_id >= 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let names: usize = self.members.iter().map(|m| m.as_bytes().len() + 1).sum();
        let mut buf = Vec::with_capacity(Self::FIXED_LEN + names);
        buf.extend_from_slice(&self.seqno.get().to_le_bytes());
        buf.extend_from_slice(&self.conf_id.to_le_bytes());
        buf.extend_from_slice(self.group_uuid.as_bytes());
        buf.push(self.st_required as u8);
        buf.extend_from_slice(&(self.members.len() as i32).to_le_bytes());
        buf.extend_from_slice(&self.my_idx.to_le_bytes());
        for member in &self.members {
            buf.extend_from_slice(member.as_bytes());
            buf.push(0);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let seqno = Seqno(read_i64(buf, 0)?);
        let conf_id = read_i64(buf, 8)?;
        if buf.len() < Self::FIXED_LEN {
            return Err(WireError::Truncated {
                need: Self::FIXED_LEN,
                got: buf.len(),
            });
        }
        let group_uuid = GroupUuid::from_bytes(
            buf[16..16 + GroupUuid::LEN]
                .try_into()
                .expect("slice length checked"),
        );
        let st_required = buf[32] != 0;
        let memb_num = read_i32(buf, 33)?;
        let my_idx = read_i32(buf, 37)?;
        if memb_num < 0 {
            return Err(WireError::BadMemberCount(memb_num as i64));
        }

        let mut members = Vec::with_capacity(memb_num as usize);
        let mut rest = &buf[Self::FIXED_LEN..];
        for _ in 0..memb_num {
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(WireError::UnterminatedMemberName)?;
            let name =
                std::str::from_utf8(&rest[..nul]).map_err(|_| WireError::UnterminatedMemberName)?;
            members.push(MemberId::new(name)?);
            rest = &rest[nul + 1..];
        }
        if !rest.is_empty() {
            return Err(WireError::TrailingBytes(rest.len()));
        }

        Ok(ConfPayload {
            seqno,
            conf_id,
            group_uuid,
            st_required,
            my_idx,
            members,
        })
    }
}

/// Flow control directive carried by a FLOW action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowPayload {
    /// `true` = stop sending, `false` = continue.
    pub stop: bool,
    /// Target member index, or -1 for the whole group.
    pub target: i32,
}

impl FlowPayload {
    /// Broadcast target sentinel.
    pub const BROADCAST: i32 = -1;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.push(self.stop as u8);
        buf.extend_from_slice(&self.target.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 5 {
            return Err(WireError::Truncated {
                need: 5,
                got: buf.len(),
            });
        }
        Ok(FlowPayload {
            stop: buf[0] != 0,
            target: i32::from_le_bytes(buf[1..5].try_into().expect("slice length checked")),
        })
    }

    /// Whether the directive addresses the member at `idx`.
    pub fn addresses(&self, idx: usize) -> bool {
        self.target == Self::BROADCAST || self.target == idx as i32
    }
}

/// Status report carried by a JOIN action. Negative status means the state
/// transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPayload {
    pub status: i64,
}

impl JoinPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.status.to_le_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        Ok(JoinPayload {
            status: read_i64(buf, 0)?,
        })
    }
}

/// Library-internal service traffic. Never delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePayload {
    /// A member announces the highest seqno it has applied.
    LastApplied(Seqno),
    /// State exchange report: a member's history position at the start of
    /// the view named by `view_id`. One per member per primary view; the
    /// collected reports yield the quorum-agreed CONF seqno and uuid.
    StateExchange {
        view_id: i64,
        seqno: Seqno,
        uuid: GroupUuid,
    },
}

impl ServicePayload {
    const KIND_LAST_APPLIED: u8 = 0;
    const KIND_STATE_EXCHANGE: u8 = 1;

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServicePayload::LastApplied(seqno) => {
                let mut buf = Vec::with_capacity(9);
                buf.push(Self::KIND_LAST_APPLIED);
                buf.extend_from_slice(&seqno.get().to_le_bytes());
                buf
            }
            ServicePayload::StateExchange {
                view_id,
                seqno,
                uuid,
            } => {
                let mut buf = Vec::with_capacity(1 + 8 + 8 + GroupUuid::LEN);
                buf.push(Self::KIND_STATE_EXCHANGE);
                buf.extend_from_slice(&view_id.to_le_bytes());
                buf.extend_from_slice(&seqno.get().to_le_bytes());
                buf.extend_from_slice(uuid.as_bytes());
                buf
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::Truncated { need: 1, got: 0 });
        }
        match buf[0] {
            Self::KIND_LAST_APPLIED => Ok(ServicePayload::LastApplied(Seqno(read_i64(buf, 1)?))),
            Self::KIND_STATE_EXCHANGE => {
                let view_id = read_i64(buf, 1)?;
                let seqno = Seqno(read_i64(buf, 9)?);
                let end = 17 + GroupUuid::LEN;
                if buf.len() < end {
                    return Err(WireError::Truncated {
                        need: end,
                        got: buf.len(),
                    });
                }
                let uuid = GroupUuid::from_bytes(
                    buf[17..end].try_into().expect("slice length checked"),
                );
                Ok(ServicePayload::StateExchange {
                    view_id,
                    seqno,
                    uuid,
                })
            }
            kind => Err(WireError::UnknownServiceKind(kind)),
        }
    }
}

/// Encode the payload of a COMMIT_CUT action.
pub fn encode_commit_cut(cut: Seqno) -> Vec<u8> {
    cut.get().to_le_bytes().to_vec()
}

/// Decode the payload of a COMMIT_CUT action.
pub fn decode_commit_cut(buf: &[u8]) -> Result<Seqno, WireError> {
    Ok(Seqno(read_i64(buf, 0)?))
}
