//! Seqno-keyed total-order monitor.
//!
//! A [`Monitor`] is an entry barrier that serializes any number of threads on
//! consecutive sequence numbers: the thread that grabbed seqno `s` runs its
//! critical section strictly after the holder of `s - 1` released and strictly
//! before the holder of `s + 1` starts. Applications use it to apply a
//! replicated, totally-ordered stream of actions under local concurrency.
//!
//! # Model
//!
//! - [`Monitor::grab`] blocks until the seqno's turn comes and returns a
//!   [`Ticket`], a scoped acquisition token.
//! - [`Monitor::release`] consumes the ticket and wakes the successor.
//! - Seqnos can be skipped: [`Monitor::cancel`] (by another holder),
//!   [`Monitor::self_cancel`] (by the would-be holder without entering), and
//!   a waiting thread can be kicked out temporarily with
//!   [`Monitor::interrupt`], after which the seqno stays live until it is
//!   re-grabbed or self-cancelled.
//! - The waiter table is a bounded ring: grabbing too far ahead of the last
//!   released seqno fails with [`OrderError::Overflow`] and may be retried
//!   after some release.
//!
//! # Example
//!
//! ```
//! use starling_order::Monitor;
//! use starling_types::Seqno;
//!
//! let to = Monitor::new(1024, Seqno::FIRST);
//! let ticket = to.grab(Seqno(1)).unwrap();
//! // ... critical section for seqno 1 ...
//! to.release(ticket).unwrap();
//! assert_eq!(to.seqno(), Seqno(1));
//! ```

mod monitor;

pub use monitor::{Monitor, OrderError, Ticket};
