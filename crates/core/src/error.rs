//! Error vocabulary of the public API.

use thiserror::Error;

use crate::ConnState;

/// Errors returned by the connection API.
///
/// Operational errors (`Busy`, `BadState`, `Overflow`, `Canceled`,
/// `Interrupted`, `NotConnected`) leave the connection usable. `Protocol`
/// and `Assembly` conditions are additionally surfaced as in-stream `Error`
/// actions so the application sees them at a well-defined point; only
/// `Fatal` tears the connection down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcsError {
    /// The connection is already open.
    #[error("connection is busy")]
    Busy,
    /// The operation is not legal in the current connection state.
    #[error("operation illegal in state {0}")]
    BadState(ConnState),
    /// A bounded queue is full; safe to retry later.
    #[error("queue would overflow, try again later")]
    Overflow,
    /// Seqno below the accepted floor.
    #[error("seqno out of range")]
    OutOfRange,
    /// The waiter was cancelled.
    #[error("operation cancelled")]
    Canceled,
    /// The wait was interrupted; retry or close.
    #[error("wait interrupted")]
    Interrupted,
    /// Not in a primary configuration, or the connection is closed.
    #[error("not connected to a primary component")]
    NotConnected,
    /// Unknown configuration key or unavailable backend.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed wire data or misused API surface.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The transport backend is gone. Terminal.
    #[error("fatal backend failure: {0}")]
    Fatal(String),
    /// Action reassembly failed (bad fragment order, size cap exceeded).
    #[error("action assembly failed: {0}")]
    Assembly(String),
    /// `close()` aborted the operation in flight.
    #[error("connection aborted by close")]
    Aborted,
}
