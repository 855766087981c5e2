//! The connection state machine.

use std::collections::{HashMap, HashSet};

use starling_core::{Config, ConnState, GcsEffect, GcsError, GcsEvent};
use starling_types::{Action, ActionType, GroupUuid, MemberId, Seqno, View};
use starling_wire::{
    encode_commit_cut, fragment_action, ConfPayload, FlowPayload, JoinPayload, ServicePayload,
    MIN_PKT_SIZE,
};
use tracing::{debug, info, trace, warn};

use crate::defrag::{Defrag, Ingest};

/// A state exchange in progress.
///
/// Every primary view opens one: each member broadcasts its history
/// position through the ordered stream, and the CONF action is fabricated
/// only once all members of the view reported. Ordered traffic arriving in
/// the meantime is buffered and replayed after the agreed position is
/// adopted, so every member numbers it identically.
struct Exchange {
    view: View,
    reported: HashMap<MemberId, (Seqno, GroupUuid)>,
    buffered: Vec<(MemberId, u64, ActionType, Vec<u8>)>,
}

/// The deterministic connection core.
///
/// Consumes [`GcsEvent`]s from the transport (and close requests from the
/// application) and returns [`GcsEffect`]s. Owns everything that must be
/// identical across nodes replaying the same ordered stream: reassembly,
/// seqno assignment, the configuration handler with its state exchange,
/// flow-control state, commit-cut tracking, and the state-transfer
/// handshake.
///
/// # Processing Flow
///
/// 1. **Message received** → assembler → complete action → typed dispatch
/// 2. **View installed** → state exchange round → CONF action
/// 3. **Data / StateRequest** → global + local seqno, delivered or matched
///    against the local repl wait table via `SelfDelivered`
/// 4. **Flow / Service** → consumed by the library, never delivered
/// 5. **Transport fatal** → synthetic NON_PRIMARY CONF, terminal Closed
pub struct ConnectionCore {
    my_id: MemberId,
    config: Config,
    state: ConnState,

    // History position
    init_seqno: Seqno,
    init_uuid: GroupUuid,
    group_uuid: GroupUuid,
    /// Last assigned global seqno.
    global_seqno: Seqno,
    /// Last assigned local seqno.
    local_seqno: Seqno,

    // Membership
    view: Option<View>,
    exchange: Option<Exchange>,
    conf_id: i64,

    // Commit cut tracking
    last_applied: HashMap<MemberId, Seqno>,
    commit_cut: Seqno,

    // Reassembly
    defrag: Defrag,

    // Flow control: members whose stop directive addressed us.
    stoppers: HashSet<MemberId>,
    flow_stopped: bool,

    // State transfer (requester side)
    donor_idx: Option<usize>,

    next_act_id: u64,
}

impl ConnectionCore {
    pub fn new(my_id: MemberId, config: Config) -> Self {
        let max_action_size = config.max_action_size;
        let mut config = config;
        if config.pkt_size < MIN_PKT_SIZE {
            warn!(
                pkt_size = config.pkt_size,
                min = MIN_PKT_SIZE,
                "pkt_size below minimum, clamping"
            );
            config.pkt_size = MIN_PKT_SIZE;
        }
        Self {
            my_id,
            config,
            state: ConnState::Created,
            init_seqno: Seqno::NIL,
            init_uuid: GroupUuid::ZERO,
            group_uuid: GroupUuid::ZERO,
            global_seqno: Seqno::NIL,
            local_seqno: Seqno::NIL,
            view: None,
            exchange: None,
            conf_id: -1,
            last_applied: HashMap::new(),
            commit_cut: Seqno::NIL,
            defrag: Defrag::new(max_action_size),
            stoppers: HashSet::new(),
            flow_stopped: false,
            donor_idx: None,
            next_act_id: 0,
        }
    }

    // ─── Lifecycle ───

    /// Install the group history hint. Legal before `open`.
    pub fn init(&mut self, seqno: Seqno, uuid: GroupUuid) -> Result<(), GcsError> {
        match self.state {
            ConnState::Created | ConnState::Inited => {
                self.init_seqno = seqno;
                self.init_uuid = uuid;
                self.state = ConnState::Inited;
                Ok(())
            }
            ConnState::Closed => Err(GcsError::BadState(self.state)),
            _ => Err(GcsError::Busy),
        }
    }

    /// Record that the channel was joined. The first view has not arrived
    /// yet, so the configuration is non-primary.
    pub fn mark_open(&mut self) -> Result<(), GcsError> {
        match self.state {
            ConnState::Created | ConnState::Inited => {
                self.state = ConnState::OpenNonPrimary;
                Ok(())
            }
            ConnState::Closed => Err(GcsError::BadState(self.state)),
            _ => Err(GcsError::Busy),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_config(&mut self, config: Config) {
        self.config = config;
        if self.config.pkt_size < MIN_PKT_SIZE {
            self.config.pkt_size = MIN_PKT_SIZE;
        }
    }

    /// Allocate the id for an outgoing action. Doubles as the repl-wait tag.
    pub fn alloc_act_id(&mut self) -> u64 {
        self.next_act_id += 1;
        self.next_act_id
    }

    /// Whether the application may inject an action of `act_type` right now.
    pub fn check_send(&self, act_type: ActionType) -> Result<(), GcsError> {
        if !act_type.is_app_originated() {
            return Err(GcsError::Protocol(format!(
                "{act_type} actions are library-generated"
            )));
        }
        match self.state {
            ConnState::Created | ConnState::Inited => Err(GcsError::BadState(self.state)),
            ConnState::OpenNonPrimary | ConnState::Closed => Err(GcsError::NotConnected),
            _ => Ok(()),
        }
    }

    /// Whether sends are currently flow-stopped.
    pub fn is_flow_stopped(&self) -> bool {
        self.flow_stopped
    }

    /// The commit cut: every member has applied at least this seqno.
    pub fn commit_cut(&self) -> Seqno {
        self.commit_cut
    }

    // ─── Event dispatch ───

    /// Process one event and return the effects to execute.
    pub fn handle(&mut self, event: GcsEvent) -> Vec<GcsEffect> {
        trace!(event = event.type_name(), state = %self.state, "core event");
        match event {
            GcsEvent::MessageReceived { source, bytes } => self.on_message(source, &bytes),
            GcsEvent::ViewInstalled { view } => self.on_view(view),
            GcsEvent::TransportFailed { reason } => self.on_transport_failed(&reason),
            GcsEvent::CloseRequested => self.on_close(),
        }
    }

    fn on_message(&mut self, source: MemberId, bytes: &[u8]) -> Vec<GcsEffect> {
        if self.state == ConnState::Closed {
            return vec![];
        }
        // Outside a primary configuration there is no total order; during a
        // state exchange messages keep flowing so they can be buffered.
        if self.exchange.is_none() && !self.state.is_primary() {
            trace!(%source, "dropping message outside primary configuration");
            return vec![];
        }
        match self.defrag.ingest(&source, bytes) {
            Ingest::Buffered => vec![],
            Ingest::Failed { act_id, reason } => {
                warn!(%source, act_id, %reason, "action assembly failed");
                let origin = self.member_index(&source);
                vec![self.deliver(Action::new(
                    ActionType::Error,
                    reason.into_bytes(),
                    origin,
                ))]
            }
            Ingest::Complete {
                act_id,
                act_type,
                payload,
            } => self.dispatch(&source, act_id, act_type, payload),
        }
    }

    fn dispatch(
        &mut self,
        source: &MemberId,
        act_id: u64,
        act_type: ActionType,
        payload: Vec<u8>,
    ) -> Vec<GcsEffect> {
        // During a state exchange, only exchange reports are processed;
        // everything else is held back until the agreed position is adopted.
        if self.exchange.is_some() {
            if act_type == ActionType::Service {
                if let Ok(ServicePayload::StateExchange {
                    view_id,
                    seqno,
                    uuid,
                }) = ServicePayload::decode(&payload)
                {
                    return self.on_state_exchange(source, view_id, seqno, uuid);
                }
            }
            trace!(%source, %act_type, "buffering action during state exchange");
            let exchange = self.exchange.as_mut().expect("exchange checked above");
            exchange
                .buffered
                .push((source.clone(), act_id, act_type, payload));
            return vec![];
        }

        let origin = self.member_index(source);
        let is_self = *source == self.my_id;
        trace!(%source, act_id, %act_type, size = payload.len(), "action assembled");

        match act_type {
            ActionType::Data => {
                self.global_seqno = self.global_seqno.next();
                let mut action = Action::new(ActionType::Data, payload, origin);
                action.global_seqno = self.global_seqno;
                action.local_seqno = self.next_local();
                if is_self {
                    vec![GcsEffect::SelfDelivered { act_id, action }]
                } else {
                    vec![GcsEffect::Deliver { action }]
                }
            }
            ActionType::StateRequest => self.on_state_request(is_self, origin, act_id, payload),
            ActionType::Join => self.on_join(is_self, origin, &payload),
            ActionType::Sync => self.on_sync(is_self, origin),
            ActionType::Flow => self.on_flow(source, &payload),
            ActionType::Service => self.on_service(source, &payload),
            ActionType::Conf
            | ActionType::CommitCut
            | ActionType::Error
            | ActionType::Unknown => {
                warn!(%source, %act_type, "unexpected action type on the wire");
                vec![self.deliver(Action::new(
                    ActionType::Error,
                    format!("unexpected {act_type} action from {source}").into_bytes(),
                    origin,
                ))]
            }
        }
    }

    /// A state transfer request was ordered. The donor is a pure function of
    /// the stream position, so every member agrees on it: the lowest member
    /// index other than the requester.
    fn on_state_request(
        &mut self,
        is_self: bool,
        origin: Option<usize>,
        act_id: u64,
        payload: Vec<u8>,
    ) -> Vec<GcsEffect> {
        self.global_seqno = self.global_seqno.next();
        let seqno = self.global_seqno;

        let donor = self
            .view
            .as_ref()
            .and_then(|v| (0..v.members.len()).find(|i| Some(*i) != origin));

        let Some(donor_idx) = donor else {
            // Nobody to donate. Only the requester cares.
            debug!(act_id, "state transfer request with no viable donor");
            return if is_self {
                vec![GcsEffect::FailRepl {
                    act_id,
                    error: GcsError::Overflow,
                }]
            } else {
                let mut action = Action::new(ActionType::StateRequest, payload, origin);
                action.global_seqno = seqno;
                action.local_seqno = self.next_local();
                vec![GcsEffect::Deliver { action }]
            };
        };

        if is_self {
            self.donor_idx = Some(donor_idx);
            let mut effects = Vec::new();
            if self.state == ConnState::OpenPrimary {
                self.set_state(ConnState::Joiner, &mut effects);
            }
            info!(donor_idx, %seqno, "state transfer request ordered");
            // The requester consumes the action through the call return; the
            // ordered slot still counts locally so the seqno can be skipped.
            let _ = self.next_local();
            effects.push(GcsEffect::CompleteStateRequest {
                act_id,
                donor_idx,
                seqno,
            });
            effects
        } else {
            let mut action = Action::new(ActionType::StateRequest, payload, origin);
            action.global_seqno = seqno;
            action.local_seqno = self.next_local();
            vec![GcsEffect::Deliver { action }]
        }
    }

    fn on_join(&mut self, is_self: bool, origin: Option<usize>, payload: &[u8]) -> Vec<GcsEffect> {
        let join = match JoinPayload::decode(payload) {
            Ok(join) => join,
            Err(e) => {
                return vec![self.deliver(Action::new(
                    ActionType::Error,
                    format!("malformed JOIN payload: {e}").into_bytes(),
                    origin,
                ))]
            }
        };

        let mut effects = Vec::new();
        let from_donor = origin.is_some() && origin == self.donor_idx;
        if self.state == ConnState::Joiner && join.status >= 0 && (is_self || from_donor) {
            info!(status = join.status, "state transfer complete");
            self.donor_idx = None;
            self.set_state(ConnState::Joined, &mut effects);
            let frames = self.control_frames(ActionType::Sync, &[]);
            effects.push(GcsEffect::Broadcast { frames });
        } else if self.state == ConnState::Joiner && join.status < 0 && (is_self || from_donor) {
            warn!(status = join.status, "state transfer failed, still a joiner");
        }

        effects.push(self.deliver(Action::new(ActionType::Join, payload.to_vec(), origin)));
        effects
    }

    fn on_sync(&mut self, is_self: bool, origin: Option<usize>) -> Vec<GcsEffect> {
        let mut effects = Vec::new();
        if is_self && self.state == ConnState::Joined {
            info!("synchronized with group");
            self.set_state(ConnState::Synced, &mut effects);
        }
        effects.push(self.deliver(Action::new(ActionType::Sync, Vec::new(), origin)));
        effects
    }

    fn on_flow(&mut self, source: &MemberId, payload: &[u8]) -> Vec<GcsEffect> {
        let flow = match FlowPayload::decode(payload) {
            Ok(flow) => flow,
            Err(e) => {
                let origin = self.member_index(source);
                return vec![self.deliver(Action::new(
                    ActionType::Error,
                    format!("malformed FLOW payload: {e}").into_bytes(),
                    origin,
                ))];
            }
        };
        let Some(my_idx) = self.view.as_ref().map(|v| v.my_idx) else {
            return vec![];
        };
        if !flow.addresses(my_idx) {
            return vec![];
        }
        if flow.stop {
            self.stoppers.insert(source.clone());
        } else {
            self.stoppers.remove(source);
        }
        debug!(%source, stop = flow.stop, stoppers = self.stoppers.len(), "flow directive");
        self.refresh_flow_gate()
    }

    fn on_service(&mut self, source: &MemberId, payload: &[u8]) -> Vec<GcsEffect> {
        let service = match ServicePayload::decode(payload) {
            Ok(service) => service,
            Err(e) => {
                let origin = self.member_index(source);
                return vec![self.deliver(Action::new(
                    ActionType::Error,
                    format!("malformed service payload: {e}").into_bytes(),
                    origin,
                ))];
            }
        };
        match service {
            ServicePayload::LastApplied(seqno) => {
                let entry = self
                    .last_applied
                    .entry(source.clone())
                    .or_insert(Seqno::NIL);
                if seqno > *entry {
                    *entry = seqno;
                }
                self.refresh_commit_cut()
            }
            ServicePayload::StateExchange { view_id, .. } => {
                // No exchange pending: a leftover report from a superseded
                // view.
                debug!(%source, view_id, "stale state exchange report");
                vec![]
            }
        }
    }

    /// Recompute the group-wide commit cut: the smallest seqno every current
    /// member reports applied. Advances monotonically; a member that has not
    /// reported yet pins the cut where it is.
    fn refresh_commit_cut(&mut self) -> Vec<GcsEffect> {
        let Some(view) = &self.view else {
            return vec![];
        };
        let cut = view
            .members
            .iter()
            .map(|m| self.last_applied.get(m).copied().unwrap_or(Seqno::NIL))
            .min()
            .unwrap_or(Seqno::NIL);
        if cut <= self.commit_cut {
            return vec![];
        }
        self.commit_cut = cut;
        debug!(%cut, "commit cut advanced");
        vec![self.deliver(Action::new(
            ActionType::CommitCut,
            encode_commit_cut(cut),
            None,
        ))]
    }

    // ─── Configuration handling ───

    fn on_view(&mut self, view: View) -> Vec<GcsEffect> {
        if !self.state.is_open() {
            return vec![];
        }
        if view.primary {
            self.start_exchange(view)
        } else {
            self.on_non_primary_view(view)
        }
    }

    /// A primary view opens a state exchange: broadcast our position and
    /// wait for everyone's before fabricating the CONF. A newer view simply
    /// restarts the round (traffic buffered under the superseded view is
    /// dropped on every member alike).
    fn start_exchange(&mut self, view: View) -> Vec<GcsEffect> {
        debug!(
            view_id = view.view_id,
            members = view.members.len(),
            "primary view, starting state exchange"
        );
        let report = ServicePayload::StateExchange {
            view_id: view.view_id,
            seqno: self.position_seqno(),
            uuid: self.current_uuid(),
        };
        let frames = self.control_frames(ActionType::Service, &report.encode());
        self.exchange = Some(Exchange {
            view,
            reported: HashMap::new(),
            buffered: Vec::new(),
        });
        vec![GcsEffect::Broadcast { frames }]
    }

    fn on_state_exchange(
        &mut self,
        source: &MemberId,
        view_id: i64,
        seqno: Seqno,
        uuid: GroupUuid,
    ) -> Vec<GcsEffect> {
        let Some(exchange) = &mut self.exchange else {
            debug!(%source, view_id, "stale state exchange report");
            return vec![];
        };
        if view_id != exchange.view.view_id || exchange.view.index_of(source).is_none() {
            debug!(%source, view_id, "state exchange report for another view");
            return vec![];
        }
        exchange.reported.insert(source.clone(), (seqno, uuid));
        trace!(
            %source,
            %seqno,
            reported = exchange.reported.len(),
            expected = exchange.view.len(),
            "state exchange report"
        );
        if exchange.reported.len() == exchange.view.len() {
            self.finalize_exchange()
        } else {
            vec![]
        }
    }

    /// Everyone reported: derive the quorum position, fabricate the CONF,
    /// transition, and replay the traffic buffered during the round.
    fn finalize_exchange(&mut self) -> Vec<GcsEffect> {
        let Exchange {
            view,
            reported,
            buffered,
        } = self.exchange.take().expect("finalize requires an exchange");
        let mut effects = Vec::new();

        // The group position is the highest any member reports; the epoch
        // uuid follows the most advanced member with history, or is derived
        // identically by everyone for a fresh group.
        let group_seqno = reported
            .values()
            .map(|(seqno, _)| *seqno)
            .max()
            .unwrap_or(Seqno::NIL);
        let group_uuid = reported
            .values()
            .filter(|(_, uuid)| uuid.is_set())
            .max_by_key(|(seqno, uuid)| (*seqno, *uuid))
            .map(|(_, uuid)| *uuid)
            .unwrap_or_else(|| {
                let mut seed = Vec::new();
                let mut ids: Vec<&MemberId> = view.members.iter().collect();
                ids.sort();
                for id in ids {
                    seed.extend_from_slice(id.as_bytes());
                    seed.push(0);
                }
                seed.extend_from_slice(&view.view_id.to_le_bytes());
                GroupUuid::derive(&seed)
            });

        // A transfer is required when there is a gap between our applied
        // history and the group's, or our history belongs to another epoch.
        let own_uuid = self.current_uuid();
        let st_required = self.position_seqno() < group_seqno
            || (own_uuid.is_set() && own_uuid != group_uuid);

        info!(
            view_id = view.view_id,
            members = view.members.len(),
            my_idx = view.my_idx,
            %group_seqno,
            %group_uuid,
            st_required,
            "primary configuration"
        );

        self.conf_id = view.view_id;
        self.group_uuid = group_uuid;
        // GCS-level counting resumes from the agreed position on every
        // member; a joiner's application state catches up via state
        // transfer.
        self.global_seqno = group_seqno;

        self.defrag.retain_members(&view);
        let member_ids: HashSet<&MemberId> = view.members.iter().collect();
        self.last_applied.retain(|id, _| member_ids.contains(id));
        self.stoppers.retain(|id| member_ids.contains(id));

        let conf = ConfPayload {
            seqno: group_seqno,
            conf_id: self.conf_id,
            group_uuid,
            st_required,
            my_idx: view.my_idx as i32,
            members: view.members.clone(),
        };
        effects.push(self.deliver_conf(conf));

        if self.state == ConnState::OpenNonPrimary {
            if st_required {
                self.set_state(ConnState::OpenPrimary, &mut effects);
            } else {
                self.set_state(ConnState::Joined, &mut effects);
                let frames = self.control_frames(ActionType::Sync, &[]);
                effects.push(GcsEffect::Broadcast { frames });
            }
        }

        self.view = Some(view);
        effects.extend(self.refresh_flow_gate());

        for (source, act_id, act_type, payload) in buffered {
            let replayed = self.dispatch(&source, act_id, act_type, payload);
            effects.extend(replayed);
        }
        effects
    }

    fn on_non_primary_view(&mut self, view: View) -> Vec<GcsEffect> {
        info!(
            view_id = view.view_id,
            members = view.members.len(),
            "non-primary configuration"
        );
        let mut effects = Vec::new();

        self.conf_id = -1;
        self.donor_idx = None;
        self.exchange = None;
        self.defrag.clear();
        self.stoppers.clear();
        effects.extend(self.refresh_flow_gate());

        // Outstanding repls can never complete: their actions may be lost.
        effects.push(GcsEffect::FailAllRepls {
            error: GcsError::NotConnected,
        });

        let conf = ConfPayload {
            seqno: self.position_seqno(),
            conf_id: -1,
            group_uuid: self.current_uuid(),
            st_required: false,
            my_idx: view.my_idx as i32,
            members: view.members.clone(),
        };
        effects.push(self.deliver_conf(conf));

        if self.state != ConnState::OpenNonPrimary {
            self.set_state(ConnState::OpenNonPrimary, &mut effects);
        }
        self.view = Some(view);
        effects
    }

    fn on_transport_failed(&mut self, reason: &str) -> Vec<GcsEffect> {
        if self.state == ConnState::Closed {
            return vec![];
        }
        warn!(%reason, "transport failed, closing");
        self.exchange = None;
        let mut effects = vec![GcsEffect::FailAllRepls {
            error: GcsError::NotConnected,
        }];
        // Synthesize the NON_PRIMARY configuration the group can no longer
        // deliver, so the application observes the boundary in-stream.
        let conf = ConfPayload {
            seqno: self.position_seqno(),
            conf_id: -1,
            group_uuid: self.current_uuid(),
            st_required: false,
            my_idx: 0,
            members: vec![self.my_id.clone()],
        };
        effects.push(self.deliver_conf(conf));
        self.set_state(ConnState::Closed, &mut effects);
        effects
    }

    fn on_close(&mut self) -> Vec<GcsEffect> {
        if self.state == ConnState::Closed {
            return vec![];
        }
        info!("closing connection");
        self.exchange = None;
        let mut effects = vec![GcsEffect::FailAllRepls {
            error: GcsError::Aborted,
        }];
        self.set_state(ConnState::Closed, &mut effects);
        effects
    }

    // ─── Helpers ───

    fn next_local(&mut self) -> Seqno {
        self.local_seqno = self.local_seqno.next();
        self.local_seqno
    }

    fn deliver(&mut self, mut action: Action) -> GcsEffect {
        action.local_seqno = self.next_local();
        GcsEffect::Deliver { action }
    }

    fn deliver_conf(&mut self, conf: ConfPayload) -> GcsEffect {
        self.deliver(Action::new(ActionType::Conf, conf.encode(), None))
    }

    fn set_state(&mut self, state: ConnState, effects: &mut Vec<GcsEffect>) {
        if self.state != state {
            info!(from = %self.state, to = %state, "connection state change");
            self.state = state;
            effects.push(GcsEffect::StateChanged { state });
        }
    }

    fn refresh_flow_gate(&mut self) -> Vec<GcsEffect> {
        let stopped = !self.stoppers.is_empty();
        if stopped == self.flow_stopped {
            return vec![];
        }
        self.flow_stopped = stopped;
        vec![GcsEffect::FlowGate { stopped }]
    }

    fn control_frames(&mut self, act_type: ActionType, payload: &[u8]) -> Vec<Vec<u8>> {
        let act_id = self.alloc_act_id();
        fragment_action(act_id, act_type, payload, self.config.pkt_size)
            .expect("pkt_size is clamped to the minimum at construction")
    }

    fn member_index(&self, id: &MemberId) -> Option<usize> {
        self.view.as_ref().and_then(|v| v.index_of(id))
    }

    /// The seqno of this node's applied history. While a state transfer is
    /// pending (OpenPrimary/Joiner) the GCS-level counter runs ahead of the
    /// application state, so only the init hint counts.
    fn position_seqno(&self) -> Seqno {
        match self.state {
            ConnState::OpenPrimary | ConnState::Joiner => self.init_seqno,
            _ => self.init_seqno.max(self.global_seqno),
        }
    }

    fn current_uuid(&self) -> GroupUuid {
        if self.group_uuid.is_set() {
            self.group_uuid
        } else {
            self.init_uuid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn member(name: &str) -> MemberId {
        MemberId::new(name).unwrap()
    }

    fn view_of(view_id: i64, primary: bool, names: &[&str], my_idx: usize) -> View {
        View {
            view_id,
            primary,
            members: names.iter().map(|n| member(n)).collect(),
            my_idx,
        }
    }

    fn opened(name: &str) -> ConnectionCore {
        let mut core = ConnectionCore::new(member(name), Config::default());
        core.mark_open().unwrap();
        core
    }

    fn feed_frames(core: &mut ConnectionCore, source: &str, frames: &[Vec<u8>]) -> Vec<GcsEffect> {
        frames
            .iter()
            .flat_map(|bytes| {
                core.handle(GcsEvent::MessageReceived {
                    source: member(source),
                    bytes: bytes.clone(),
                })
            })
            .collect()
    }

    /// Execute effects like a loopback transport: every `Broadcast` is fed
    /// back to the core as messages from ourselves.
    fn feed_and_loop(
        core: &mut ConnectionCore,
        my_name: &str,
        initial: Vec<GcsEffect>,
    ) -> Vec<GcsEffect> {
        let mut all = initial;
        let mut i = 0;
        while i < all.len() {
            if let GcsEffect::Broadcast { frames } = &all[i] {
                let frames = frames.clone();
                let more = feed_frames(core, my_name, &frames);
                all.extend(more);
            }
            i += 1;
        }
        all
    }

    fn peer_report_frames(view_id: i64, seqno: i64, uuid: GroupUuid, act_id: u64) -> Vec<Vec<u8>> {
        fragment_action(
            act_id,
            ActionType::Service,
            &ServicePayload::StateExchange {
                view_id,
                seqno: Seqno(seqno),
                uuid,
            }
            .encode(),
            Config::default().pkt_size,
        )
        .unwrap()
    }

    /// Install a primary view: our own exchange report is looped back, and
    /// each peer reports the given `(seqno, uuid)` position.
    fn install_primary(
        core: &mut ConnectionCore,
        view_id: i64,
        names: &[&str],
        my_idx: usize,
        peers: &[(&str, i64, GroupUuid)],
    ) -> Vec<GcsEffect> {
        let initial = core.handle(GcsEvent::ViewInstalled {
            view: view_of(view_id, true, names, my_idx),
        });
        assert!(
            initial
                .iter()
                .any(|e| matches!(e, GcsEffect::Broadcast { .. })),
            "a primary view must broadcast a state exchange report"
        );
        let mut all = feed_and_loop(core, names[my_idx], initial);
        for (i, (name, seqno, uuid)) in peers.iter().enumerate() {
            let frames = peer_report_frames(view_id, *seqno, *uuid, 900 + i as u64);
            let more = feed_frames(core, name, &frames);
            all.extend(feed_and_loop(core, names[my_idx], more));
        }
        all
    }

    /// Open a core, bring a fresh group up, and land in Synced.
    fn synced(names: &[&str], my_idx: usize) -> ConnectionCore {
        let mut core = opened(names[my_idx]);
        let peers: Vec<(&str, i64, GroupUuid)> = names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != my_idx)
            .map(|(_, n)| (*n, 0, GroupUuid::ZERO))
            .collect();
        install_primary(&mut core, 1, names, my_idx, &peers);
        assert_eq!(core.state(), ConnState::Synced);
        core
    }

    fn delivered(effects: &[GcsEffect]) -> Vec<Action> {
        effects
            .iter()
            .filter_map(|e| match e {
                GcsEffect::Deliver { action } => Some(action.clone()),
                _ => None,
            })
            .collect()
    }

    fn data_frames(act_id: u64, payload: &[u8], pkt_size: usize) -> Vec<Vec<u8>> {
        fragment_action(act_id, ActionType::Data, payload, pkt_size).unwrap()
    }

    #[test]
    fn init_is_rejected_once_open() {
        let mut core = ConnectionCore::new(member("a"), Config::default());
        core.init(Seqno(10), GroupUuid::random()).unwrap();
        assert_eq!(core.state(), ConnState::Inited);
        core.mark_open().unwrap();
        assert_eq!(
            core.init(Seqno(11), GroupUuid::random()),
            Err(GcsError::Busy)
        );
    }

    #[test]
    fn sends_rejected_before_primary() {
        let mut core = ConnectionCore::new(member("a"), Config::default());
        assert_eq!(
            core.check_send(ActionType::Data),
            Err(GcsError::BadState(ConnState::Created))
        );
        core.mark_open().unwrap();
        assert_eq!(core.check_send(ActionType::Data), Err(GcsError::NotConnected));
        assert!(matches!(
            core.check_send(ActionType::Flow),
            Err(GcsError::Protocol(_))
        ));
    }

    #[test]
    fn fresh_primary_view_promotes_to_joined_then_synced() {
        let mut core = opened("a");
        let effects = install_primary(&mut core, 1, &["a"], 0, &[]);

        let actions = delivered(&effects);
        assert_eq!(actions.len(), 2, "conf and sync expected: {actions:?}");

        let conf = ConfPayload::decode(&actions[0].buf).unwrap();
        assert_eq!(conf.conf_id, 1);
        assert!(!conf.st_required);
        assert!(conf.group_uuid.is_set());
        assert_eq!(conf.members, vec![member("a")]);
        assert_eq!(actions[0].local_seqno, Seqno(1));
        assert_eq!(actions[0].global_seqno, Seqno::ILL);

        assert_eq!(actions[1].act_type, ActionType::Sync);
        assert_eq!(actions[1].local_seqno, Seqno(2));
        assert_eq!(core.state(), ConnState::Synced);
    }

    #[test]
    fn peer_data_is_ordered_and_delivered() {
        let mut core = synced(&["a", "b"], 0);
        let payload = vec![0x5au8; 250];
        let effects = feed_frames(&mut core, "b", &data_frames(1, &payload, 100));

        let actions = delivered(&effects);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].act_type, ActionType::Data);
        assert_eq!(actions[0].buf, payload);
        assert_eq!(actions[0].global_seqno, Seqno(1));
        assert_eq!(actions[0].local_seqno, Seqno(3)); // conf, sync, data
        assert_eq!(actions[0].origin, Some(1));

        // The next action continues both sequences.
        let effects = feed_frames(&mut core, "b", &data_frames(2, b"x", 100));
        let actions = delivered(&effects);
        assert_eq!(actions[0].global_seqno, Seqno(2));
        assert_eq!(actions[0].local_seqno, Seqno(4));
    }

    #[test]
    fn own_data_surfaces_as_self_delivery() {
        let mut core = synced(&["a", "b"], 0);
        let act_id = core.alloc_act_id();
        let effects = feed_frames(&mut core, "a", &data_frames(act_id, b"mine", 100));
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            GcsEffect::SelfDelivered { act_id: id, action } => {
                assert_eq!(*id, act_id);
                assert_eq!(action.buf, b"mine");
                assert_eq!(action.global_seqno, Seqno(1));
            }
            other => panic!("expected SelfDelivered, got {other:?}"),
        }
    }

    /// Traffic racing a membership change is buffered during the exchange
    /// and numbered from the agreed position afterwards.
    #[test]
    fn traffic_during_state_exchange_is_replayed_in_order() {
        let mut core = synced(&["a", "b"], 0);

        // A new member appears; the exchange round begins.
        let initial = core.handle(GcsEvent::ViewInstalled {
            view: view_of(2, true, &["a", "b", "c"], 0),
        });
        let mut effects = feed_and_loop(&mut core, "a", initial);

        // b's data lands mid-exchange: buffered, not delivered.
        effects.extend(feed_frames(&mut core, "b", &data_frames(5, b"early", 100)));
        assert!(delivered(&effects).is_empty(), "nothing before the CONF");

        // The missing reports complete the round.
        let uuid = core_uuid(&core);
        effects.extend(feed_frames(&mut core, "b", &peer_report_frames(2, 0, uuid, 901)));
        effects.extend(feed_frames(
            &mut core,
            "c",
            &peer_report_frames(2, 0, GroupUuid::ZERO, 902),
        ));

        let actions = delivered(&effects);
        assert_eq!(actions[0].act_type, ActionType::Conf);
        let data: Vec<&Action> = actions
            .iter()
            .filter(|a| a.act_type == ActionType::Data)
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].buf, b"early");
        assert_eq!(data[0].global_seqno, Seqno(1));
    }

    fn core_uuid(core: &ConnectionCore) -> GroupUuid {
        core.current_uuid()
    }

    #[test]
    fn assembly_violation_surfaces_as_error_action() {
        let mut core = synced(&["a", "b"], 0);
        let frames = data_frames(1, &[0u8; 250], 100);
        // Skip the first fragment.
        let effects = feed_frames(&mut core, "b", &frames[1..2]);
        let actions = delivered(&effects);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].act_type, ActionType::Error);
        assert_eq!(actions[0].global_seqno, Seqno::ILL);
        assert!(actions[0].local_seqno.is_ordered());
    }

    #[test]
    fn non_primary_view_fails_repls_and_blocks_sends() {
        let mut core = synced(&["a", "b"], 0);
        assert!(core.check_send(ActionType::Data).is_ok());

        let effects = core.handle(GcsEvent::ViewInstalled {
            view: view_of(2, false, &["a"], 0),
        });
        assert!(effects.contains(&GcsEffect::FailAllRepls {
            error: GcsError::NotConnected
        }));
        let actions = delivered(&effects);
        let conf = ConfPayload::decode(&actions[0].buf).unwrap();
        assert_eq!(conf.conf_id, -1);
        assert!(!conf.is_primary());
        assert_eq!(core.state(), ConnState::OpenNonPrimary);
        assert_eq!(core.check_send(ActionType::Data), Err(GcsError::NotConnected));

        // Messages are dropped outside a primary configuration.
        let effects = feed_frames(&mut core, "a", &data_frames(9, b"lost", 100));
        assert!(effects.is_empty());

        // A primary view restores progress.
        let uuid = core.current_uuid();
        let effects = install_primary(&mut core, 3, &["a", "b"], 0, &[("b", 0, uuid)]);
        assert!(!delivered(&effects).is_empty());
        assert_eq!(core.state(), ConnState::Synced);
        assert!(core.check_send(ActionType::Data).is_ok());
    }

    #[test]
    fn flow_stop_and_cont_toggle_the_gate() {
        let mut core = synced(&["a", "b"], 0);
        let stop = FlowPayload {
            stop: true,
            target: FlowPayload::BROADCAST,
        };
        let frames =
            fragment_action(1, ActionType::Flow, &stop.encode(), core.config().pkt_size).unwrap();
        let effects = feed_frames(&mut core, "b", &frames);
        assert_eq!(effects, vec![GcsEffect::FlowGate { stopped: true }]);
        assert!(core.is_flow_stopped());

        let cont = FlowPayload {
            stop: false,
            target: FlowPayload::BROADCAST,
        };
        let frames =
            fragment_action(2, ActionType::Flow, &cont.encode(), core.config().pkt_size).unwrap();
        let effects = feed_frames(&mut core, "b", &frames);
        assert_eq!(effects, vec![GcsEffect::FlowGate { stopped: false }]);
        assert!(!core.is_flow_stopped());
    }

    #[test]
    fn targeted_flow_ignores_other_members() {
        let mut core = synced(&["a", "b", "c"], 0);
        let stop = FlowPayload {
            stop: true,
            target: 2, // addresses "c", not us
        };
        let frames =
            fragment_action(1, ActionType::Flow, &stop.encode(), core.config().pkt_size).unwrap();
        let effects = feed_frames(&mut core, "b", &frames);
        assert!(effects.is_empty());
        assert!(!core.is_flow_stopped());
    }

    #[test]
    fn commit_cut_is_the_minimum_over_members() {
        let mut core = synced(&["a", "b"], 0);
        let pkt = core.config().pkt_size;
        let report = |seqno: i64, act_id: u64| {
            fragment_action(
                act_id,
                ActionType::Service,
                &ServicePayload::LastApplied(Seqno(seqno)).encode(),
                pkt,
            )
            .unwrap()
        };

        // Only one member reported: the cut stays put.
        let effects = feed_frames(&mut core, "b", &report(5, 1));
        assert!(delivered(&effects).is_empty());

        // Both reported: cut = min(3, 5) = 3.
        let effects = feed_frames(&mut core, "a", &report(3, 2));
        let actions = delivered(&effects);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].act_type, ActionType::CommitCut);
        assert_eq!(
            starling_wire::decode_commit_cut(&actions[0].buf),
            Ok(Seqno(3))
        );
        assert_eq!(core.commit_cut(), Seqno(3));

        // Raising the laggard advances to the other member's report.
        let effects = feed_frames(&mut core, "a", &report(7, 3));
        let actions = delivered(&effects);
        assert_eq!(
            starling_wire::decode_commit_cut(&actions[0].buf),
            Ok(Seqno(5))
        );
    }

    /// Full joiner-side handshake: behind group -> OpenPrimary ->
    /// StateRequest ordered -> Joiner -> donor JOIN -> Joined -> own SYNC ->
    /// Synced.
    #[test]
    fn joiner_walks_the_state_transfer_handshake() {
        let epoch = GroupUuid::derive(b"established");
        let mut core = opened("c");
        let effects = install_primary(
            &mut core,
            4,
            &["a", "b", "c"],
            2,
            &[("a", 5, epoch), ("b", 5, epoch)],
        );
        let conf = ConfPayload::decode(&delivered(&effects)[0].buf).unwrap();
        assert!(conf.st_required);
        assert_eq!(conf.seqno, Seqno(5));
        assert_eq!(conf.group_uuid, epoch);
        assert_eq!(core.state(), ConnState::OpenPrimary);

        // Our state request comes back through the ordered stream.
        let act_id = core.alloc_act_id();
        let frames =
            fragment_action(act_id, ActionType::StateRequest, b"req", core.config().pkt_size)
                .unwrap();
        let effects = feed_frames(&mut core, "c", &frames);
        assert_eq!(core.state(), ConnState::Joiner);
        assert!(effects.contains(&GcsEffect::CompleteStateRequest {
            act_id,
            donor_idx: 0,
            seqno: Seqno(6),
        }));

        // Donor reports successful transfer; our SYNC is looped back.
        let join_frames = fragment_action(
            77,
            ActionType::Join,
            &JoinPayload { status: 0 }.encode(),
            core.config().pkt_size,
        )
        .unwrap();
        let initial = feed_frames(&mut core, "a", &join_frames);
        let effects = feed_and_loop(&mut core, "c", initial);
        assert!(delivered(&effects)
            .iter()
            .any(|a| a.act_type == ActionType::Join));
        assert_eq!(core.state(), ConnState::Synced);
    }

    /// Donor side of the same handshake: the request is delivered through
    /// the receive path at the ordered seqno.
    #[test]
    fn donor_receives_the_state_request_in_stream() {
        let mut core = synced(&["a", "b", "c"], 0);
        let frames =
            fragment_action(5, ActionType::StateRequest, b"req", core.config().pkt_size).unwrap();
        let effects = feed_frames(&mut core, "c", &frames);
        let actions = delivered(&effects);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].act_type, ActionType::StateRequest);
        assert_eq!(actions[0].buf, b"req");
        assert_eq!(actions[0].global_seqno, Seqno(1));
        assert_eq!(actions[0].origin, Some(2));
    }

    #[test]
    fn single_member_state_request_has_no_donor() {
        let mut core = synced(&["a"], 0);
        let act_id = core.alloc_act_id();
        let frames =
            fragment_action(act_id, ActionType::StateRequest, b"req", core.config().pkt_size)
                .unwrap();
        let effects = feed_frames(&mut core, "a", &frames);
        assert_eq!(
            effects,
            vec![GcsEffect::FailRepl {
                act_id,
                error: GcsError::Overflow
            }]
        );
    }

    #[test]
    fn transport_failure_synthesizes_non_primary_and_closes() {
        let mut core = synced(&["a", "b"], 0);
        let effects = core.handle(GcsEvent::TransportFailed {
            reason: "backend gone".into(),
        });
        assert!(effects.contains(&GcsEffect::FailAllRepls {
            error: GcsError::NotConnected
        }));
        let actions = delivered(&effects);
        let conf = ConfPayload::decode(&actions[0].buf).unwrap();
        assert!(!conf.is_primary());
        assert_eq!(core.state(), ConnState::Closed);

        // Terminal: further events are ignored.
        assert!(core
            .handle(GcsEvent::ViewInstalled {
                view: view_of(9, true, &["a"], 0)
            })
            .is_empty());
    }

    #[test]
    fn close_aborts_repls() {
        let mut core = synced(&["a"], 0);
        let effects = core.handle(GcsEvent::CloseRequested);
        assert!(effects.contains(&GcsEffect::FailAllRepls {
            error: GcsError::Aborted
        }));
        assert_eq!(core.state(), ConnState::Closed);
    }

    /// Two cores replaying the same event sequence produce identical effect
    /// sequences, and each node's local seqnos are gapless from 1.
    #[test]
    fn replay_is_deterministic_and_local_seqnos_are_gapless() {
        let names = ["a", "b", "c"];
        let make_events = || {
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            let mut events = Vec::new();
            for i in 0..60u64 {
                let source = names[rng.gen_range(0..names.len())];
                let size = rng.gen_range(0..400);
                let payload: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
                for bytes in data_frames(1000 + i, &payload, 96) {
                    events.push((source, bytes));
                }
            }
            events
        };

        let drive = || {
            let mut core = opened("a");
            let mut all = install_primary(
                &mut core,
                1,
                &names,
                0,
                &[("b", 0, GroupUuid::ZERO), ("c", 0, GroupUuid::ZERO)],
            );
            for (source, bytes) in make_events() {
                let effects = core.handle(GcsEvent::MessageReceived {
                    source: member(source),
                    bytes,
                });
                all.extend(feed_and_loop(&mut core, "a", effects));
            }
            all
        };

        let effects_one = drive();
        let effects_two = drive();
        assert_eq!(effects_one, effects_two);

        let mut expected_local = Seqno::NIL;
        let mut expected_global = Seqno::NIL;
        for effect in &effects_one {
            let action = match effect {
                GcsEffect::Deliver { action } => action,
                GcsEffect::SelfDelivered { action, .. } => action,
                _ => continue,
            };
            expected_local = expected_local.next();
            assert_eq!(action.local_seqno, expected_local, "local seqno gap");
            if action.act_type.is_globally_ordered() {
                expected_global = expected_global.next();
                assert_eq!(action.global_seqno, expected_global, "global seqno gap");
            }
        }
        assert!(expected_local.is_ordered(), "stream delivered something");
    }
}
