//! The deterministic connection state machine of the starling core.
//!
//! [`ConnectionCore`] multiplexes application actions onto a message-oriented
//! group transport and turns the ordered message stream back into actions:
//! it reassembles fragments, assigns global and local seqnos, threads
//! configuration changes and the state-transfer handshake through the same
//! ordered stream, and tracks flow control and commit cuts.
//!
//! The core is synchronous and performs no I/O: it consumes
//! [`GcsEvent`](starling_core::GcsEvent)s and returns
//! [`GcsEffect`](starling_core::GcsEffect)s for the facade to execute.
//! Because it is deterministic, two nodes replaying the same ordered
//! message stream deliver identical actions with identical seqnos.

mod defrag;
mod state;

pub use defrag::{Defrag, Ingest};
pub use state::ConnectionCore;
