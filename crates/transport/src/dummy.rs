//! In-process dummy backend.
//!
//! A [`DummyHub`] is one group: every endpoint created from it receives all
//! broadcasts (its own included) in a single total order, plus membership
//! views as endpoints come and go. The hub mutex is the total order: every
//! broadcast and every view change is fanned out to all member inboxes while
//! holding it.
//!
//! Tests drive the interesting group behaviors directly:
//! [`DummyHub::set_primary`] injects non-primary/primary transitions,
//! [`DummyHub::set_partitioned`] loses messages in flight, and
//! [`DummyHub::fail`] kills the group under its members.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use starling_types::{MemberId, View};
use tracing::debug;

use crate::{Backend, TransportError, TransportEvent};

#[derive(Debug)]
struct Member {
    id: MemberId,
    tx: Sender<TransportEvent>,
}

#[derive(Debug)]
struct HubState {
    view_id: i64,
    primary: bool,
    failed: bool,
    /// While set, broadcasts are dropped on the floor (a partition from
    /// everyone, ourselves included). Views still go through.
    partitioned: bool,
    members: Vec<Member>,
}

impl HubState {
    fn fan_out_view(&mut self) {
        self.view_id += 1;
        let ids: Vec<MemberId> = self.members.iter().map(|m| m.id.clone()).collect();
        for (idx, member) in self.members.iter().enumerate() {
            let view = View {
                view_id: self.view_id,
                primary: self.primary,
                members: ids.clone(),
                my_idx: idx,
            };
            let _ = member.tx.send(TransportEvent::View(view));
        }
    }
}

/// One in-process group.
#[derive(Clone)]
pub struct DummyHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for DummyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyHub {
    pub fn new() -> Self {
        DummyHub {
            state: Arc::new(Mutex::new(HubState {
                view_id: 0,
                primary: true,
                failed: false,
                partitioned: false,
                members: Vec::new(),
            })),
        }
    }

    /// Join the group and get a backend endpoint for `id`.
    ///
    /// The first event every member observes after a join is the new view.
    pub fn endpoint(&self, id: MemberId) -> Result<DummyEndpoint, TransportError> {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock().expect("hub mutex poisoned");
        if state.failed {
            return Err(TransportError::Closed);
        }
        if state.members.iter().any(|m| m.id == id) {
            return Err(TransportError::Fatal(format!(
                "member '{id}' already in the group"
            )));
        }
        debug!(%id, "dummy endpoint joining");
        state.members.push(Member { id: id.clone(), tx });
        state.fan_out_view();
        Ok(DummyEndpoint {
            id,
            hub: Arc::clone(&self.state),
            rx,
        })
    }

    /// Flip the group's primary flag and install a new view. Used by tests
    /// to simulate quorum loss and recovery.
    pub fn set_primary(&self, primary: bool) {
        let mut state = self.state.lock().expect("hub mutex poisoned");
        if state.primary != primary {
            state.primary = primary;
            state.fan_out_view();
        }
    }

    /// While partitioned, broadcasts are silently lost (messages in flight
    /// during a partition never arrive). Views still go through.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.state.lock().expect("hub mutex poisoned").partitioned = partitioned;
    }

    /// Kill the group: every member observes a fatal failure and the event
    /// streams end.
    pub fn fail(&self, reason: &str) {
        let mut state = self.state.lock().expect("hub mutex poisoned");
        state.failed = true;
        for member in &state.members {
            let _ = member.tx.send(TransportEvent::Failed {
                reason: reason.to_string(),
            });
        }
        state.members.clear();
    }

    /// Current member count.
    pub fn len(&self) -> usize {
        self.state.lock().expect("hub mutex poisoned").members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A member's endpoint into a [`DummyHub`] group.
#[derive(Debug)]
pub struct DummyEndpoint {
    id: MemberId,
    hub: Arc<Mutex<HubState>>,
    rx: Receiver<TransportEvent>,
}

impl Backend for DummyEndpoint {
    fn broadcast(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let state = self.hub.lock().expect("hub mutex poisoned");
        if state.failed {
            return Err(TransportError::Fatal("group failed".into()));
        }
        if !state.members.iter().any(|m| m.id == self.id) {
            return Err(TransportError::Closed);
        }
        if state.partitioned {
            return Ok(());
        }
        for member in &state.members {
            let _ = member.tx.send(TransportEvent::Message {
                source: self.id.clone(),
                bytes: frame.clone(),
            });
        }
        Ok(())
    }

    fn events(&self) -> Receiver<TransportEvent> {
        self.rx.clone()
    }

    fn close(&self) {
        let mut state = self.hub.lock().expect("hub mutex poisoned");
        let before = state.members.len();
        state.members.retain(|m| m.id != self.id);
        if state.members.len() != before {
            debug!(id = %self.id, "dummy endpoint leaving");
            if !state.members.is_empty() {
                state.fan_out_view();
            }
        }
    }
}
