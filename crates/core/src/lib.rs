//! Event/effect vocabulary of the starling connection core.
//!
//! This crate defines the interface of the deterministic connection state
//! machine:
//!
//! - [`GcsEvent`]: all possible inputs to the connection core
//! - [`GcsEffect`]: all possible outputs from the connection core
//! - [`ConnState`]: the connection lifecycle states
//! - [`GcsError`]: the error vocabulary of the public API
//! - [`Config`] / [`LogSink`]: connection configuration knobs
//!
//! # Architecture
//!
//! The connection core follows a plain event-driven model:
//!
//! ```text
//! events in -> ConnectionCore::handle() -> effects out
//! ```
//!
//! The core never blocks and never touches I/O; it only mutates itself.
//! Feeding the same events to two cores yields the same effects, which is
//! what lets two nodes replaying the same ordered stream deliver identical
//! actions.
//!
//! All I/O and all blocking live in the facade, which feeds transport
//! messages and views to the core, then executes the returned effects
//! (queue pushes, waiter wakeups, broadcasts) after releasing the core
//! lock. No lock is held across a call into application code.

mod config;
mod effect;
mod error;
mod event;
mod state;

pub use config::{Config, LogSink, DEFAULT_PKT_SIZE};
pub use effect::GcsEffect;
pub use error::GcsError;
pub use event::GcsEvent;
pub use state::ConnState;
