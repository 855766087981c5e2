//! Repl wait table.
//!
//! A `repl` (and a state transfer request) registers a waiter keyed by the
//! outgoing action id before its first fragment ships. When the action
//! comes back through the ordered stream, the delivery thread moves the
//! outcome into the waiter and removes the entry; the caller wakes with the
//! assigned seqnos. Entries left behind by a failed send are deregistered
//! by the sender.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use starling_core::GcsError;
use starling_types::Seqno;

/// What a registered waiter ends up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReplOutcome {
    /// The action was self-delivered with these seqnos.
    Replicated { global: Seqno, local: Seqno },
    /// The state transfer request was ordered; donor chosen.
    StateTransfer { donor_idx: usize, seqno: Seqno },
    /// The wait failed (non-primary, close, no donor).
    Failed(GcsError),
}

struct Waiter {
    outcome: Mutex<Option<ReplOutcome>>,
    cond: Condvar,
}

/// Handle a registered caller blocks on.
pub(crate) struct ReplHandle {
    act_id: u64,
    waiter: Arc<Waiter>,
}

impl ReplHandle {
    /// Block until the delivery thread (or a failure path) fills the
    /// outcome.
    pub fn wait(self) -> ReplOutcome {
        let mut outcome = self
            .waiter
            .outcome
            .lock()
            .expect("repl waiter mutex poisoned");
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            outcome = self
                .waiter
                .cond
                .wait(outcome)
                .expect("repl waiter mutex poisoned");
        }
    }

    pub fn act_id(&self) -> u64 {
        self.act_id
    }
}

/// Maps in-flight locally originated actions to caller wakeups.
#[derive(Default)]
pub(crate) struct ReplTable {
    waiters: Mutex<HashMap<u64, Arc<Waiter>>>,
}

impl ReplTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter under `act_id`. Must happen before the first
    /// fragment of the action is broadcast.
    pub fn register(&self, act_id: u64) -> ReplHandle {
        let waiter = Arc::new(Waiter {
            outcome: Mutex::new(None),
            cond: Condvar::new(),
        });
        self.waiters
            .lock()
            .expect("repl table mutex poisoned")
            .insert(act_id, Arc::clone(&waiter));
        ReplHandle { act_id, waiter }
    }

    /// Remove a registration whose send never went out.
    pub fn deregister(&self, act_id: u64) {
        self.waiters
            .lock()
            .expect("repl table mutex poisoned")
            .remove(&act_id);
    }

    /// Fill the waiter registered under `act_id`, if any. Returns whether a
    /// waiter consumed the outcome.
    pub fn complete(&self, act_id: u64, outcome: ReplOutcome) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("repl table mutex poisoned")
            .remove(&act_id);
        match waiter {
            Some(waiter) => {
                *waiter.outcome.lock().expect("repl waiter mutex poisoned") = Some(outcome);
                waiter.cond.notify_all();
                true
            }
            None => false,
        }
    }

    /// Fail every registered waiter.
    pub fn fail_all(&self, error: GcsError) {
        let drained: Vec<Arc<Waiter>> = self
            .waiters
            .lock()
            .expect("repl table mutex poisoned")
            .drain()
            .map(|(_, w)| w)
            .collect();
        for waiter in drained {
            *waiter.outcome.lock().expect("repl waiter mutex poisoned") =
                Some(ReplOutcome::Failed(error.clone()));
            waiter.cond.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().expect("repl table mutex poisoned").len()
    }
}
