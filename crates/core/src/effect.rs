//! Effect types for the deterministic connection core.

use starling_types::{Action, Seqno};

use crate::{ConnState, GcsError};

/// Actions the connection core wants performed.
///
/// Effects are commands describing something to do. The facade executes
/// them after releasing the core lock, so no lock is ever held across
/// queue wakeups, waiter completions, or transport writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcsEffect {
    /// Hand a delivered action to the receive queue.
    Deliver { action: Action },

    /// A locally originated action came back through the ordered stream.
    /// If a repl waiter is registered under `act_id`, complete it with the
    /// action's seqnos and consume the action; otherwise deliver it.
    SelfDelivered { act_id: u64, action: Action },

    /// This node's state transfer request was ordered. Complete the
    /// requesting waiter with the donor index and the seqno to skip in
    /// local total-order queues.
    CompleteStateRequest {
        act_id: u64,
        donor_idx: usize,
        seqno: Seqno,
    },

    /// Fail one registered waiter (e.g. a state request with no viable
    /// donor).
    FailRepl { act_id: u64, error: GcsError },

    /// Fail every registered waiter (non-primary view, fatal transport,
    /// close).
    FailAllRepls { error: GcsError },

    /// Broadcast library-originated frames (SYNC after promotion).
    Broadcast { frames: Vec<Vec<u8>> },

    /// The connection lifecycle state changed.
    StateChanged { state: ConnState },

    /// The send admission gate toggled. `stopped == true` blocks (or
    /// rejects, per configuration) new sends until the gate reopens.
    FlowGate { stopped: bool },
}

impl GcsEffect {
    /// Get the effect type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            GcsEffect::Deliver { .. } => "Deliver",
            GcsEffect::SelfDelivered { .. } => "SelfDelivered",
            GcsEffect::CompleteStateRequest { .. } => "CompleteStateRequest",
            GcsEffect::FailRepl { .. } => "FailRepl",
            GcsEffect::FailAllRepls { .. } => "FailAllRepls",
            GcsEffect::Broadcast { .. } => "Broadcast",
            GcsEffect::StateChanged { .. } => "StateChanged",
            GcsEffect::FlowGate { .. } => "FlowGate",
        }
    }
}
