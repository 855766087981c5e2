//! Actions: the unit of totally-ordered delivery.

use std::fmt;

use crate::Seqno;

/// Action types.
///
/// Messages are the elementary pieces the group transport delivers atomically;
/// actions are the arbitrary-sized payloads the application deals in, spanning
/// one or more messages. Only [`Data`](ActionType::Data) and
/// [`StateRequest`](ActionType::StateRequest) originate from the application;
/// the rest are generated by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionType {
    /// Application payload.
    Data = 0,
    /// Group-wide commit cut advanced.
    CommitCut = 1,
    /// Request for a state transfer.
    StateRequest = 2,
    /// New configuration (membership change).
    Conf = 3,
    /// State transfer finished (donor status report).
    Join = 4,
    /// Node is synchronized with the group.
    Sync = 5,
    /// Flow control directive.
    Flow = 6,
    /// Library-internal service traffic.
    Service = 7,
    /// An error occurred while receiving an action.
    Error = 8,
    /// Undefined or unrecognized.
    Unknown = 9,
}

impl ActionType {
    /// Wire byte for this type.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire byte; unrecognized values map to [`ActionType::Unknown`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ActionType::Data,
            1 => ActionType::CommitCut,
            2 => ActionType::StateRequest,
            3 => ActionType::Conf,
            4 => ActionType::Join,
            5 => ActionType::Sync,
            6 => ActionType::Flow,
            7 => ActionType::Service,
            8 => ActionType::Error,
            _ => ActionType::Unknown,
        }
    }

    /// Whether the application is allowed to originate this type.
    pub fn is_app_originated(self) -> bool {
        matches!(self, ActionType::Data | ActionType::StateRequest)
    }

    /// Whether this type consumes a global seqno when delivered.
    pub fn is_globally_ordered(self) -> bool {
        matches!(self, ActionType::Data | ActionType::StateRequest)
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            ActionType::Data => "Data",
            ActionType::CommitCut => "CommitCut",
            ActionType::StateRequest => "StateRequest",
            ActionType::Conf => "Conf",
            ActionType::Join => "Join",
            ActionType::Sync => "Sync",
            ActionType::Flow => "Flow",
            ActionType::Service => "Service",
            ActionType::Error => "Error",
            ActionType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully assembled action as delivered to (or injected by) the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Action type.
    pub act_type: ActionType,
    /// Payload bytes.
    pub buf: Vec<u8>,
    /// Cluster-wide ordinal within the epoch; [`Seqno::ILL`] for actions that
    /// are not globally serialized.
    pub global_seqno: Seqno,
    /// Gapless per-node ordinal over locally delivered actions.
    pub local_seqno: Seqno,
    /// Member index of the sender within the configuration the action was
    /// delivered in; `None` for locally synthesized actions.
    pub origin: Option<usize>,
}

impl Action {
    /// An action with no ordering assigned yet.
    pub fn new(act_type: ActionType, buf: Vec<u8>, origin: Option<usize>) -> Self {
        Self {
            act_type,
            buf,
            global_seqno: Seqno::ILL,
            local_seqno: Seqno::ILL,
            origin,
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }
}
