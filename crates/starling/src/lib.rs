//! Client core of a virtually-synchronous, totally-ordered group
//! communication service.
//!
//! Replicated application nodes inject arbitrary-sized **actions** into an
//! ordered channel and receive them back in identical order on every
//! member. The library multiplexes actions onto a message-oriented group
//! transport, reassembles them, assigns global and local sequence numbers,
//! threads configuration changes and the state-transfer handshake through
//! the same ordered stream, and enforces flow control. A standalone
//! total-order [`Monitor`] lets application threads serialize local
//! critical sections against that global order.
//!
//! # Quick start
//!
//! ```
//! use starling::{ActionType, Config, Connection};
//!
//! let conn = Connection::create("dummy://", "node-0", Config::default()).unwrap();
//! conn.open("my-channel").unwrap();
//!
//! // The first delivered action is the CONF describing our configuration.
//! let conf = conn.recv().unwrap();
//! assert_eq!(conf.act_type, ActionType::Conf);
//!
//! let (global, local) = conn.repl(b"hello group", ActionType::Data).unwrap();
//! assert!(global.is_ordered());
//! assert!(local.is_ordered());
//! conn.close().unwrap();
//! ```
//!
//! # Architecture
//!
//! ```text
//! app threads ──send/repl──► [fragmentation] ──► Backend ──► network
//! network ──► Backend ──► delivery thread ──► ConnectionCore ──► effects
//!                                   │
//!               receive queue ◄─────┴────► repl wait table
//! ```
//!
//! The deterministic [`ConnectionCore`](starling_conn::ConnectionCore)
//! consumes transport events and returns effects; the delivery thread
//! executes them with no lock held. Blocking (queues, repl waits, flow
//! gates, the TO monitor) lives entirely in this crate.

mod connection;
mod queue;
mod repl;
mod telemetry;

pub use connection::Connection;
pub use starling_core::{Config, ConnState, GcsError, LogSink, DEFAULT_PKT_SIZE};
pub use starling_order::{Monitor, OrderError, Ticket};
pub use starling_transport::{
    dummy::DummyHub, Backend, BackendRegistry, BackendUrl, TransportError,
};
pub use starling_types::{Action, ActionType, GroupUuid, MemberId, Seqno, View};
