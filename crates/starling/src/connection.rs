//! The blocking connection API.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use starling_conn::ConnectionCore;
use starling_core::{Config, ConnState, GcsEffect, GcsError, GcsEvent};
use starling_transport::{
    Backend, BackendRegistry, BackendUrl, TransportError, TransportEvent,
};
use starling_types::{Action, ActionType, GroupUuid, MemberId, Seqno};
use starling_wire::{fragment_action, FlowPayload, JoinPayload, ServicePayload, MIN_PKT_SIZE};
use tracing::{debug, warn};

use crate::queue::RecvQueue;
use crate::repl::{ReplHandle, ReplOutcome, ReplTable};
use crate::telemetry;

/// Gate the send path blocks on while flow-stopped.
struct SendGate {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl SendGate {
    fn new() -> Self {
        SendGate {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self, stopped: bool) {
        *self.stopped.lock().expect("send gate mutex poisoned") = stopped;
        if !stopped {
            self.cond.notify_all();
        }
    }
}

/// State shared between the application threads and the delivery thread.
struct Shared {
    core: Mutex<ConnectionCore>,
    recv_q: RecvQueue,
    repls: ReplTable,
    gate: SendGate,
    /// Serializes frame emission so the fragments of one action are
    /// contiguous on the wire.
    send_lock: Mutex<()>,
    backend: Mutex<Option<Arc<dyn Backend>>>,
    /// Whether we broadcast a flow stop that has not been continued yet.
    fc_stopped: Mutex<bool>,
}

impl Shared {
    fn backend(&self) -> Result<Arc<dyn Backend>, GcsError> {
        self.backend
            .lock()
            .expect("backend mutex poisoned")
            .clone()
            .ok_or(GcsError::NotConnected)
    }

    /// Emit frames while the caller holds `send_lock`.
    fn broadcast_locked(&self, frames: &[Vec<u8>]) -> Result<(), GcsError> {
        let backend = self.backend()?;
        for frame in frames {
            backend.broadcast(frame.clone()).map_err(map_transport)?;
        }
        Ok(())
    }

    /// Build and emit one library-originated action.
    fn broadcast_control(&self, act_type: ActionType, payload: &[u8]) -> Result<(), GcsError> {
        let _guard = self.send_lock.lock().expect("send lock poisoned");
        let (_, frames) = self.prepare_frames(act_type, payload)?;
        self.broadcast_locked(&frames)
    }

    /// Allocate an action id and fragment the payload.
    fn prepare_frames(
        &self,
        act_type: ActionType,
        payload: &[u8],
    ) -> Result<(u64, Vec<Vec<u8>>), GcsError> {
        let (act_id, pkt_size) = {
            let mut core = self.core.lock().expect("core mutex poisoned");
            (core.alloc_act_id(), core.config().pkt_size)
        };
        let frames = fragment_action(act_id, act_type, payload, pkt_size)
            .map_err(|e| GcsError::Protocol(e.to_string()))?;
        Ok((act_id, frames))
    }

    fn fc_limits(&self) -> (usize, usize) {
        let core = self.core.lock().expect("core mutex poisoned");
        (core.config().fc_upper_limit, core.config().fc_lower_limit)
    }

    /// After a delivery: if the receive queue crossed the upper watermark,
    /// ask the group to stop.
    fn maybe_flow_stop(&self) {
        let (upper, _) = self.fc_limits();
        if self.recv_q.len() < upper {
            return;
        }
        {
            let mut sent = self.fc_stopped.lock().expect("fc mutex poisoned");
            if *sent {
                return;
            }
            *sent = true;
        }
        debug!(queue = self.recv_q.len(), "receive queue long, broadcasting flow stop");
        self.broadcast_flow(true);
    }

    /// After a recv: if the queue drained past the lower watermark, let the
    /// group continue.
    fn maybe_flow_cont(&self) {
        let (_, lower) = self.fc_limits();
        {
            let mut sent = self.fc_stopped.lock().expect("fc mutex poisoned");
            if !*sent || self.recv_q.len() > lower {
                return;
            }
            *sent = false;
        }
        debug!(queue = self.recv_q.len(), "receive queue drained, broadcasting flow cont");
        self.broadcast_flow(false);
    }

    fn broadcast_flow(&self, stop: bool) {
        let payload = FlowPayload {
            stop,
            target: FlowPayload::BROADCAST,
        }
        .encode();
        if let Err(e) = self.broadcast_control(ActionType::Flow, &payload) {
            warn!(error = %e, stop, "flow control broadcast failed");
        }
    }

    /// Execute core effects. Runs with no lock held.
    fn apply_effects(&self, effects: Vec<GcsEffect>) {
        for effect in effects {
            match effect {
                GcsEffect::Deliver { action } => {
                    self.recv_q.push(action);
                    self.maybe_flow_stop();
                }
                GcsEffect::SelfDelivered { act_id, action } => {
                    let outcome = ReplOutcome::Replicated {
                        global: action.global_seqno,
                        local: action.local_seqno,
                    };
                    if !self.repls.complete(act_id, outcome) {
                        // Plain send: the action surfaces through recv like
                        // on every other member.
                        self.recv_q.push(action);
                        self.maybe_flow_stop();
                    }
                }
                GcsEffect::CompleteStateRequest {
                    act_id,
                    donor_idx,
                    seqno,
                } => {
                    if !self
                        .repls
                        .complete(act_id, ReplOutcome::StateTransfer { donor_idx, seqno })
                    {
                        warn!(act_id, "state transfer completion with no waiter");
                    }
                }
                GcsEffect::FailRepl { act_id, error } => {
                    self.repls.complete(act_id, ReplOutcome::Failed(error));
                }
                GcsEffect::FailAllRepls { error } => self.repls.fail_all(error),
                GcsEffect::Broadcast { frames } => {
                    let _guard = self.send_lock.lock().expect("send lock poisoned");
                    if let Err(e) = self.broadcast_locked(&frames) {
                        warn!(error = %e, "library broadcast failed");
                    }
                }
                GcsEffect::StateChanged { state } => {
                    if state == ConnState::Closed {
                        self.recv_q.close();
                        self.gate.set(false);
                    }
                }
                GcsEffect::FlowGate { stopped } => self.gate.set(stopped),
            }
        }
    }
}

fn map_transport(e: TransportError) -> GcsError {
    match e {
        TransportError::Closed => GcsError::NotConnected,
        TransportError::BadUrl(url) => GcsError::Protocol(format!("bad backend url '{url}'")),
        TransportError::Unsupported(scheme) => GcsError::NotFound(scheme),
        TransportError::Fatal(reason) => GcsError::Fatal(reason),
    }
}

fn delivery_loop(shared: Arc<Shared>, events: Receiver<TransportEvent>) {
    debug!("delivery thread started");
    for event in events.iter() {
        let gcs_event = match event {
            TransportEvent::Message { source, bytes } => {
                GcsEvent::MessageReceived { source, bytes }
            }
            TransportEvent::View(view) => GcsEvent::ViewInstalled { view },
            TransportEvent::Failed { reason } => GcsEvent::TransportFailed { reason },
        };
        let effects = {
            let mut core = shared.core.lock().expect("core mutex poisoned");
            core.handle(gcs_event)
        };
        shared.apply_effects(effects);
    }
    // The stream ended: the backend left the group. Make sure the
    // connection winds down even without an explicit close().
    let effects = {
        let mut core = shared.core.lock().expect("core mutex poisoned");
        core.handle(GcsEvent::CloseRequested)
    };
    shared.apply_effects(effects);
    debug!("delivery thread exiting");
}

/// A connection to a totally-ordered group channel.
///
/// Application threads call [`send`](Connection::send),
/// [`repl`](Connection::repl) and [`recv`](Connection::recv) concurrently;
/// one internal delivery thread consumes the transport and drives the
/// [`ConnectionCore`]. No lock is held across a call into application code.
pub struct Connection {
    shared: Arc<Shared>,
    my_id: MemberId,
    url: BackendUrl,
    registry: BackendRegistry,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Create a connection handle for `backend_url` (`type://address`).
    ///
    /// Fails with [`GcsError::NotFound`] for backend types nobody
    /// registered; the built-in registry knows `dummy`.
    pub fn create(backend_url: &str, node_name: &str, config: Config) -> Result<Self, GcsError> {
        Self::create_with_registry(backend_url, node_name, config, BackendRegistry::with_defaults())
    }

    /// Like [`create`](Connection::create) with a caller-supplied backend
    /// registry (network backends, test hubs).
    pub fn create_with_registry(
        backend_url: &str,
        node_name: &str,
        config: Config,
        registry: BackendRegistry,
    ) -> Result<Self, GcsError> {
        let url = BackendUrl::parse(backend_url).map_err(map_transport)?;
        if !registry.supports(&url.scheme) {
            return Err(GcsError::NotFound(url.scheme));
        }
        let my_id =
            MemberId::new(node_name).map_err(|e| GcsError::Protocol(e.to_string()))?;
        if config.pkt_size < MIN_PKT_SIZE {
            return Err(GcsError::Protocol(format!(
                "pkt_size {} below minimum {MIN_PKT_SIZE}",
                config.pkt_size
            )));
        }
        telemetry::install_log_sink(&config)?;

        let recv_limit = config.recv_q_limit;
        Ok(Connection {
            shared: Arc::new(Shared {
                core: Mutex::new(ConnectionCore::new(my_id.clone(), config)),
                recv_q: RecvQueue::new(recv_limit),
                repls: ReplTable::new(),
                gate: SendGate::new(),
                send_lock: Mutex::new(()),
                backend: Mutex::new(None),
                fc_stopped: Mutex::new(false),
            }),
            my_id,
            url,
            registry,
            delivery: Mutex::new(None),
        })
    }

    /// Install the group history hint `(seqno, uuid)`. Optional; legal only
    /// before [`open`](Connection::open).
    pub fn init(&self, seqno: Seqno, uuid: GroupUuid) -> Result<(), GcsError> {
        self.shared.core.lock().expect("core mutex poisoned").init(seqno, uuid)
    }

    /// Join `channel` and start the delivery thread. The first delivered
    /// CONF action reports the configuration this node landed in.
    pub fn open(&self, channel: &str) -> Result<(), GcsError> {
        let mut delivery = self.delivery.lock().expect("delivery handle poisoned");

        {
            let core = self.shared.core.lock().expect("core mutex poisoned");
            match core.state() {
                ConnState::Created | ConnState::Inited => {}
                ConnState::Closed => return Err(GcsError::BadState(ConnState::Closed)),
                _ => return Err(GcsError::Busy),
            }
        }

        let mut url = self.url.clone();
        if !channel.is_empty() {
            url.address = channel.to_string();
        }
        let backend = self
            .registry
            .connect_url(&url, &self.my_id)
            .map_err(map_transport)?;
        let backend: Arc<dyn Backend> = Arc::from(backend);

        self.shared
            .core
            .lock()
            .expect("core mutex poisoned")
            .mark_open()?;
        *self.shared.backend.lock().expect("backend mutex poisoned") =
            Some(Arc::clone(&backend));

        let shared = Arc::clone(&self.shared);
        let events = backend.events();
        let handle = thread::Builder::new()
            .name(format!("starling-delivery-{}", self.my_id))
            .spawn(move || delivery_loop(shared, events))
            .map_err(|e| GcsError::Fatal(format!("cannot spawn delivery thread: {e}")))?;
        *delivery = Some(handle);
        Ok(())
    }

    /// Leave the group: fails outstanding repls with
    /// [`GcsError::Aborted`], empties the receive queue, and joins the
    /// delivery thread. Idempotent.
    pub fn close(&self) -> Result<(), GcsError> {
        let effects = {
            let mut core = self.shared.core.lock().expect("core mutex poisoned");
            core.handle(GcsEvent::CloseRequested)
        };
        self.shared.apply_effects(effects);
        if let Some(backend) = self
            .shared
            .backend
            .lock()
            .expect("backend mutex poisoned")
            .take()
        {
            backend.close();
        }
        self.shared.recv_q.close();
        self.shared.gate.set(false);
        if let Some(handle) = self
            .delivery
            .lock()
            .expect("delivery handle poisoned")
            .take()
        {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.shared.core.lock().expect("core mutex poisoned").state()
    }

    /// Non-blocking group congestion check: `Ok(1)` when the caller should
    /// hold off (flow stopped or a long local queue), `Ok(0)` otherwise.
    pub fn wait(&self) -> Result<i32, GcsError> {
        let core = self.shared.core.lock().expect("core mutex poisoned");
        if !core.state().is_primary() {
            return Err(GcsError::NotConnected);
        }
        let congested =
            core.is_flow_stopped() || self.shared.recv_q.len() >= core.config().fc_upper_limit;
        Ok(congested as i32)
    }

    /// Send an action to the group and return. The action surfaces through
    /// [`recv`](Connection::recv) on every member, this node included.
    pub fn send(&self, buf: &[u8], act_type: ActionType) -> Result<usize, GcsError> {
        self.admit(act_type)?;
        let _guard = self.shared.send_lock.lock().expect("send lock poisoned");
        self.shared
            .core
            .lock()
            .expect("core mutex poisoned")
            .check_send(act_type)?;
        let (_, frames) = self.shared.prepare_frames(act_type, buf)?;
        self.shared.broadcast_locked(&frames)?;
        Ok(buf.len())
    }

    /// Replicate an action: send it and block until it returns through the
    /// ordered stream, yielding its `(global_seqno, local_seqno)`. The
    /// action is consumed by this call and never appears in this node's
    /// receive queue.
    pub fn repl(&self, buf: &[u8], act_type: ActionType) -> Result<(Seqno, Seqno), GcsError> {
        let handle = self.launch_wait(buf, act_type)?;
        match handle.wait() {
            ReplOutcome::Replicated { global, local } => Ok((global, local)),
            ReplOutcome::Failed(error) => Err(error),
            ReplOutcome::StateTransfer { .. } => {
                Err(GcsError::Protocol("repl completed as a state transfer".into()))
            }
        }
    }

    /// Block until an action is delivered.
    pub fn recv(&self) -> Result<Action, GcsError> {
        let action = self.shared.recv_q.pop()?;
        self.shared.maybe_flow_cont();
        Ok(action)
    }

    /// Broadcast a state transfer request and block until it is ordered.
    /// Returns `(donor_idx, skip_seqno)`: the member chosen as donor and
    /// the global seqno of the request, which local total-order queues must
    /// skip. [`GcsError::Overflow`] means no donor is available yet.
    pub fn request_state_transfer(&self, req: &[u8]) -> Result<(usize, Seqno), GcsError> {
        {
            let core = self.shared.core.lock().expect("core mutex poisoned");
            match core.state() {
                ConnState::OpenPrimary | ConnState::Joiner => {}
                state => return Err(GcsError::BadState(state)),
            }
        }
        let handle = self.launch_wait(req, ActionType::StateRequest)?;
        match handle.wait() {
            ReplOutcome::StateTransfer { donor_idx, seqno } => Ok((donor_idx, seqno)),
            ReplOutcome::Failed(error) => Err(error),
            ReplOutcome::Replicated { .. } => Err(GcsError::Protocol(
                "state transfer request completed as a repl".into(),
            )),
        }
    }

    /// Report the outcome of a state transfer on behalf of the donor (or a
    /// failed one on behalf of the joiner). Non-negative status promotes
    /// the joiner.
    pub fn join(&self, status: i64) -> Result<(), GcsError> {
        if !self.state().is_primary() {
            return Err(GcsError::NotConnected);
        }
        self.shared
            .broadcast_control(ActionType::Join, &JoinPayload { status }.encode())
    }

    /// Announce the highest seqno this node has applied. Feeds the
    /// group-wide commit cut.
    pub fn set_last_applied(&self, seqno: Seqno) -> Result<(), GcsError> {
        if !self.state().is_primary() {
            return Err(GcsError::NotConnected);
        }
        self.shared.broadcast_control(
            ActionType::Service,
            &ServicePayload::LastApplied(seqno).encode(),
        )
    }

    /// Set a configuration knob by name.
    pub fn param_set(&self, key: &str, value: &str) -> Result<(), GcsError> {
        let mut core = self.shared.core.lock().expect("core mutex poisoned");
        let mut config = core.config().clone();
        config.param_set(key, value)?;
        core.set_config(config);
        Ok(())
    }

    /// This node's member id.
    pub fn node_id(&self) -> &MemberId {
        &self.my_id
    }

    // ─── Internals ───

    /// Admission for application sends: state must allow the type, and the
    /// flow gate must be open (or `flow_nonblock` turns the wait into
    /// [`GcsError::Overflow`]).
    fn admit(&self, act_type: ActionType) -> Result<(), GcsError> {
        loop {
            let nonblock = {
                let core = self.shared.core.lock().expect("core mutex poisoned");
                core.check_send(act_type)?;
                if !core.is_flow_stopped() {
                    return Ok(());
                }
                core.config().flow_nonblock
            };
            if nonblock {
                return Err(GcsError::Overflow);
            }
            let stopped = self.shared.gate.stopped.lock().expect("send gate mutex poisoned");
            if !*stopped {
                continue;
            }
            let _unused = self
                .shared
                .gate
                .cond
                .wait(stopped)
                .expect("send gate mutex poisoned");
        }
    }

    /// Register a waiter and ship the action; on a send failure the
    /// registration is rolled back.
    fn launch_wait(&self, buf: &[u8], act_type: ActionType) -> Result<ReplHandle, GcsError> {
        self.admit(act_type)?;
        let _guard = self.shared.send_lock.lock().expect("send lock poisoned");
        self.shared
            .core
            .lock()
            .expect("core mutex poisoned")
            .check_send(act_type)?;
        let (act_id, frames) = self.shared.prepare_frames(act_type, buf)?;
        let handle = self.shared.repls.register(act_id);
        if let Err(e) = self.shared.broadcast_locked(&frames) {
            self.shared.repls.deregister(act_id);
            return Err(e);
        }
        Ok(handle)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.my_id)
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}
