//! Scheduler core state machine
//!
//! All maps live behind one mutex owned by the server; the methods here
//! take `&mut self` and never perform I/O. Outbound pushes (model tables
//! to backends, routes to frontends) are returned as [`Outbound`] intents
//! and dispatched by the caller after the lock is released.

use crate::backend_delegate::BackendDelegate;
use crate::config::{SchedulerConfig, WorkloadEntry};
use crate::frontend_delegate::FrontendDelegate;
use crate::session_info::{SessionHandle, SessionInfo};
use nexus_core::{CtrlStatus, InstanceInfo, ModelDatabase, ModelSession, NodeType};
use nexus_proto::{
    BackendRate, BackendStats, ControlReply, ControlRequest, KeepAliveRequest, LoadModelReply,
    LoadModelRequest, ModelRoute, ModelRouteUpdates, RegisterReply, RegisterRequest, RpcReply,
    UnregisterRequest,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// A control push planned while the state mutex was held, dispatched by
/// the server after release
#[derive(Debug, Clone)]
pub enum Outbound {
    /// New model table for a backend
    ModelTable {
        addr: String,
        update: nexus_proto::ModelTableUpdate,
    },
    /// Batch of route updates for a frontend
    ModelRoutes {
        addr: String,
        updates: ModelRouteUpdates,
    },
}

/// The scheduler's global view of the fabric
pub struct Scheduler {
    beacon_interval: Duration,
    beacon_interval_sec: u64,
    epoch_interval_sec: u64,
    enable_epoch_schedule: bool,
    enable_prefix_batch: bool,

    /// Epoch estimation needs at least this many RPS samples
    min_history_len: usize,
    /// RPS history is trimmed to this length
    history_len: usize,

    model_db: ModelDatabase,

    backends: BTreeMap<u32, BackendDelegate>,
    frontends: BTreeMap<u32, FrontendDelegate>,

    /// Session records; several ids alias one record under prefix sharing
    sessions: HashMap<SessionHandle, SessionInfo>,
    /// Every member session id -> its record
    session_index: HashMap<String, SessionHandle>,
    /// Session id -> frontends subscribed to it
    session_subscribers: HashMap<String, BTreeSet<u32>>,

    static_workloads: Vec<Vec<WorkloadEntry>>,
    /// Workload slot -> backend currently holding it
    assigned_static_workloads: BTreeMap<usize, u32>,

    next_handle: u64,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        model_db: ModelDatabase,
        static_workloads: Vec<Vec<WorkloadEntry>>,
    ) -> Self {
        let min_history_len = ((config.epoch_interval_sec + config.beacon_interval_sec - 1)
            / config.beacon_interval_sec) as usize;
        if !config.epoch_schedule {
            info!("Epoch scheduling is off");
        }
        if !config.prefix_batch {
            info!("Prefix batching is off");
        }
        Self {
            beacon_interval: Duration::from_secs(config.beacon_interval_sec),
            beacon_interval_sec: config.beacon_interval_sec,
            epoch_interval_sec: config.epoch_interval_sec,
            enable_epoch_schedule: config.epoch_schedule,
            enable_prefix_batch: config.prefix_batch,
            min_history_len,
            history_len: min_history_len * 2,
            model_db,
            backends: BTreeMap::new(),
            frontends: BTreeMap::new(),
            sessions: HashMap::new(),
            session_index: HashMap::new(),
            session_subscribers: HashMap::new(),
            static_workloads,
            assigned_static_workloads: BTreeMap::new(),
            next_handle: 0,
        }
    }

    /// Whether the epoch loop should run at all
    pub fn epoch_schedule_enabled(&self) -> bool {
        self.enable_epoch_schedule
    }

    pub fn beacon_interval_sec(&self) -> u64 {
        self.beacon_interval_sec
    }

    pub fn epoch_interval_sec(&self) -> u64 {
        self.epoch_interval_sec
    }

    /// Look up a backend delegate
    pub fn backend(&self, node_id: u32) -> Option<&BackendDelegate> {
        self.backends.get(&node_id)
    }

    /// Look up the placement record behind a session id
    pub fn session_info(&self, model_sess_id: &str) -> Option<&SessionInfo> {
        let handle = self.session_index.get(model_sess_id)?;
        self.sessions.get(handle)
    }

    /// Frontends subscribed to a session id
    pub fn subscribers(&self, model_sess_id: &str) -> Option<&BTreeSet<u32>> {
        self.session_subscribers.get(model_sess_id)
    }

    fn alloc_handle(&mut self) -> SessionHandle {
        let handle = SessionHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Dispatch one control request. `peer_ip` is the connection's remote
    /// address; registering nodes are reached back at that IP.
    pub fn dispatch(
        &mut self,
        request: ControlRequest,
        peer_ip: String,
        now: Instant,
    ) -> (ControlReply, Vec<Outbound>) {
        match request {
            ControlRequest::Register(req) => {
                let (reply, outbound) = self.register(req, peer_ip, now);
                (ControlReply::Register(reply), outbound)
            }
            ControlRequest::Unregister(req) => {
                let (reply, outbound) = self.unregister(req, now);
                (ControlReply::Rpc(reply), outbound)
            }
            ControlRequest::LoadModel(req) => {
                let (reply, outbound) = self.load_model(req, now);
                (ControlReply::LoadModel(reply), outbound)
            }
            ControlRequest::UpdateBackendStats(stats) => (
                ControlReply::Rpc(self.update_backend_stats(stats, now)),
                Vec::new(),
            ),
            ControlRequest::KeepAlive(req) => {
                (ControlReply::Rpc(self.keep_alive(req, now)), Vec::new())
            }
        }
    }

    /// Handle `Register`
    pub fn register(
        &mut self,
        request: RegisterRequest,
        ip: String,
        now: Instant,
    ) -> (RegisterReply, Vec<Outbound>) {
        info!(
            node = request.node_id,
            node_type = %request.node_type,
            %ip,
            "Register node"
        );
        let beacon_interval_sec = self.beacon_interval_sec as u32;
        match request.node_type {
            NodeType::Backend => {
                if self.backends.contains_key(&request.node_id) {
                    return (
                        RegisterReply {
                            status: CtrlStatus::BackendNodeIdConflict,
                            beacon_interval_sec,
                        },
                        Vec::new(),
                    );
                }
                let delegate = BackendDelegate::new(
                    request.node_id,
                    ip,
                    request.server_port,
                    request.rpc_port,
                    request.gpu_device_name.clone().unwrap_or_default(),
                    request.gpu_available_memory_mb.unwrap_or(0),
                    self.beacon_interval,
                    now,
                );
                self.backends.insert(request.node_id, delegate);
                let changed = self.add_backend(request.node_id, now);
                let mut outbound = self.drain_model_table_updates();
                outbound.extend(self.model_route_updates(&changed));
                (
                    RegisterReply {
                        status: CtrlStatus::Ok,
                        beacon_interval_sec,
                    },
                    outbound,
                )
            }
            NodeType::Frontend => {
                if self.frontends.contains_key(&request.node_id) {
                    return (
                        RegisterReply {
                            status: CtrlStatus::FrontendNodeIdConflict,
                            beacon_interval_sec,
                        },
                        Vec::new(),
                    );
                }
                let delegate = FrontendDelegate::new(
                    request.node_id,
                    ip,
                    request.server_port,
                    request.rpc_port,
                    self.beacon_interval,
                    now,
                );
                self.frontends.insert(request.node_id, delegate);
                (
                    RegisterReply {
                        status: CtrlStatus::Ok,
                        beacon_interval_sec,
                    },
                    Vec::new(),
                )
            }
        }
    }

    /// Handle `Unregister`; idempotent when the node is already gone
    pub fn unregister(
        &mut self,
        request: UnregisterRequest,
        now: Instant,
    ) -> (RpcReply, Vec<Outbound>) {
        info!(
            node = request.node_id,
            node_type = %request.node_type,
            "Unregister node"
        );
        let reply = RpcReply {
            status: CtrlStatus::Ok,
        };
        match request.node_type {
            NodeType::Backend => {
                let Some(removed) = self.backends.remove(&request.node_id) else {
                    error!(backend = request.node_id, "Cannot find backend");
                    return (reply, Vec::new());
                };
                let changed = self.remove_backend(removed, now);
                let mut outbound = self.drain_model_table_updates();
                outbound.extend(self.model_route_updates(&changed));
                (reply, outbound)
            }
            NodeType::Frontend => {
                let Some(frontend) = self.frontends.remove(&request.node_id) else {
                    error!(frontend = request.node_id, "Cannot find frontend");
                    return (reply, Vec::new());
                };
                self.remove_frontend(frontend);
                (reply, self.drain_model_table_updates())
            }
        }
    }

    /// Handle `LoadModel`
    pub fn load_model(
        &mut self,
        request: LoadModelRequest,
        now: Instant,
    ) -> (LoadModelReply, Vec<Outbound>) {
        let fail = |status| {
            (
                LoadModelReply {
                    status,
                    model_route: None,
                },
                Vec::new(),
            )
        };

        let mut model_sess = request.model_session.clone();
        let Some(info) = self.model_db.get(&model_sess.model_id()) else {
            return fail(CtrlStatus::ModelNotFound);
        };
        if info.resizable && !model_sess.has_dims() {
            // Resizable CNNs acquire default input dimensions
            model_sess = model_sess.with_dims(info.image_height, info.image_width);
        }
        let model_sess_id = model_sess.session_id();
        let workload = request.estimate_workload;

        if !self.frontends.contains_key(&request.node_id) {
            return fail(CtrlStatus::ServerNotRegistered);
        }

        if self.session_index.contains_key(&model_sess_id) {
            // Session already placed; epoch scheduling absorbs the extra
            // workload, so just subscribe and return the current route
            self.subscribe(request.node_id, &model_sess_id);
            return (
                LoadModelReply {
                    status: CtrlStatus::Ok,
                    model_route: self.model_route(&model_sess_id),
                },
                Vec::new(),
            );
        }

        if self.enable_prefix_batch {
            if let Some((share_handle, share_sess_id)) = self.find_prefix_share(&model_sess) {
                info!(
                    session = %model_sess_id,
                    share = %share_sess_id,
                    "Model session shares prefix with existing session"
                );
                let backend_ids: Vec<u32> = self
                    .sessions
                    .get(&share_handle)
                    .map(|s| s.backend_throughputs.keys().copied().collect())
                    .unwrap_or_default();
                for node_id in backend_ids {
                    if let Some(backend) = self.backends.get_mut(&node_id) {
                        backend.load_prefix_model(model_sess.clone(), &share_sess_id);
                    }
                }
                if let Some(session) = self.sessions.get_mut(&share_handle) {
                    session.model_sessions.push(model_sess.clone());
                }
                self.session_index
                    .insert(model_sess_id.clone(), share_handle);
                self.subscribe(request.node_id, &model_sess_id);
                let reply = LoadModelReply {
                    status: CtrlStatus::Ok,
                    model_route: self.model_route(&model_sess_id),
                };
                return (reply, self.drain_model_table_updates());
            }
        }

        // Find best-fit backends to serve the workload
        let mut assigned: Vec<(u32, InstanceInfo)> = Vec::new();
        let mut used = BTreeSet::new();
        if workload <= 0.0 {
            match self.find_best_backend(&model_sess, 0.0, &used, now) {
                Some(pick) => assigned.push(pick),
                None => return fail(CtrlStatus::NotEnoughBackends),
            }
        } else {
            let mut remaining = workload;
            while remaining > 0.0 {
                let Some((node_id, inst)) =
                    self.find_best_backend(&model_sess, remaining, &used, now)
                else {
                    return fail(CtrlStatus::NotEnoughBackends);
                };
                used.insert(node_id);
                remaining -= inst.throughput;
                assigned.push((node_id, inst));
            }
        }

        let handle = self.alloc_handle();
        let mut session = SessionInfo::new(model_sess.clone());
        for (node_id, inst) in assigned {
            let throughput = inst.throughput;
            if let Some(backend) = self.backends.get_mut(&node_id) {
                backend.load_model(model_sess.clone(), inst);
            }
            session.backend_throughputs.insert(node_id, throughput);
        }
        self.sessions.insert(handle, session);
        self.session_index.insert(model_sess_id.clone(), handle);
        self.subscribe(request.node_id, &model_sess_id);

        let reply = LoadModelReply {
            status: CtrlStatus::Ok,
            model_route: self.model_route(&model_sess_id),
        };
        (reply, self.drain_model_table_updates())
    }

    /// Handle `UpdateBackendStats`; doubles as the backend liveness tick
    pub fn update_backend_stats(&mut self, stats: BackendStats, now: Instant) -> RpcReply {
        let Some(backend) = self.backends.get_mut(&stats.node_id) else {
            error!(backend = stats.node_id, "Cannot find backend");
            return RpcReply {
                status: CtrlStatus::ServerNotRegistered,
            };
        };
        backend.update_stats(&stats, now);
        RpcReply {
            status: CtrlStatus::Ok,
        }
    }

    /// Handle `KeepAlive` from a frontend
    pub fn keep_alive(&mut self, request: KeepAliveRequest, now: Instant) -> RpcReply {
        let Some(frontend) = self.frontends.get_mut(&request.node_id) else {
            error!(frontend = request.node_id, "Cannot find frontend");
            return RpcReply {
                status: CtrlStatus::ServerNotRegistered,
            };
        };
        frontend.tick(now);
        RpcReply {
            status: CtrlStatus::Ok,
        }
    }

    fn subscribe(&mut self, frontend_id: u32, model_sess_id: &str) {
        if let Some(frontend) = self.frontends.get_mut(&frontend_id) {
            frontend.subscribe_model(model_sess_id);
        }
        self.session_subscribers
            .entry(model_sess_id.to_string())
            .or_default()
            .insert(frontend_id);
    }

    /// Find an existing session this one can share a prefix with: same
    /// SLA, same dimensions, a model in the same prefix group
    fn find_prefix_share(&self, model_sess: &ModelSession) -> Option<(SessionHandle, String)> {
        for peer_model_id in self.model_db.prefix_share_peers(&model_sess.model_id()) {
            let tokens: Vec<&str> = peer_model_id.split(':').collect();
            if tokens.len() != 3 {
                continue;
            }
            let Ok(version) = tokens[2].parse::<u32>() else {
                continue;
            };
            let peer_sess = ModelSession::new(
                tokens[0],
                tokens[1],
                version,
                model_sess.latency_sla_ms,
            )
            .with_dims(model_sess.image_height, model_sess.image_width);
            let peer_sess_id = peer_sess.session_id();
            if let Some(&handle) = self.session_index.get(&peer_sess_id) {
                return Some((handle, peer_sess_id));
            }
        }
        None
    }

    /// Workload-driven backend choice (spec: FindBestBackend).
    ///
    /// Tracks the candidate with the highest throughput and the one with
    /// the highest occupancy; zero-rate requests go to the
    /// highest-throughput idle backend, uncoverable rates to the
    /// highest-throughput backend (the caller loops), and coverable rates
    /// bin-pack by occupancy.
    fn find_best_backend(
        &self,
        model_sess: &ModelSession,
        request_rate: f64,
        skips: &BTreeSet<u32>,
        now: Instant,
    ) -> Option<(u32, InstanceInfo)> {
        let mut max_tp: Option<(u32, InstanceInfo)> = None;
        let mut max_occ: Option<(u32, InstanceInfo, f64)> = None;
        for (&node_id, backend) in &self.backends {
            if skips.contains(&node_id) {
                continue;
            }
            if !backend.is_alive(now) || backend.workload_id().is_some() {
                continue;
            }
            if request_rate <= 0.0 && !backend.is_idle() {
                continue;
            }
            let Some((inst, occupancy)) =
                backend.prepare_load_model(&self.model_db, model_sess, request_rate)
            else {
                continue;
            };
            if max_tp
                .as_ref()
                .map_or(true, |(_, best)| inst.throughput > best.throughput)
            {
                max_tp = Some((node_id, inst.clone()));
            }
            if max_occ.as_ref().map_or(true, |(_, _, best)| occupancy > *best) {
                max_occ = Some((node_id, inst, occupancy));
            }
        }
        if request_rate <= 0.0 {
            return max_tp;
        }
        let (tp_id, tp_inst) = max_tp?;
        if tp_inst.throughput < request_rate {
            // No single backend covers the rate; hand back the biggest
            Some((tp_id, tp_inst))
        } else {
            max_occ.map(|(node_id, inst, _)| (node_id, inst))
        }
    }

    /// Integrate a newly registered backend: hand it an unassigned static
    /// workload slot if one exists, otherwise drain overflow onto it
    fn add_backend(&mut self, node_id: u32, now: Instant) -> BTreeSet<SessionHandle> {
        let mut changed = BTreeSet::new();

        let slot = (0..self.static_workloads.len())
            .find(|id| !self.assigned_static_workloads.contains_key(id));
        if let Some(slot) = slot {
            self.assigned_static_workloads.insert(slot, node_id);
            info!(workload = slot, backend = node_id, "Assign static workload");
            let entries = self.static_workloads[slot].clone();
            {
                let Self {
                    ref model_db,
                    ref mut backends,
                    ..
                } = *self;
                if let Some(backend) = backends.get_mut(&node_id) {
                    for entry in &entries {
                        let session = entry.session();
                        if entry.backup {
                            backend.add_backup_session(session.session_id());
                        } else {
                            backend.load_static_model(model_db, session);
                        }
                    }
                    backend.set_workload_id(slot);
                }
            }

            // Create/extend session records for everything that loaded
            let loaded = self
                .backends
                .get(&node_id)
                .map(|b| b.model_sessions())
                .unwrap_or_default();
            for model_sess_id in loaded {
                let throughput = self
                    .backends
                    .get(&node_id)
                    .map(|b| b.model_throughput(&model_sess_id))
                    .unwrap_or(0.0);
                let handle = match self.session_index.get(&model_sess_id) {
                    Some(&handle) => handle,
                    None => {
                        let Ok(session) = ModelSession::parse(&model_sess_id) else {
                            error!(session = %model_sess_id, "Unparseable session id");
                            continue;
                        };
                        let handle = self.alloc_handle();
                        let mut record = SessionInfo::new(session);
                        record.has_static_workload = true;
                        self.sessions.insert(handle, record);
                        self.session_index.insert(model_sess_id.clone(), handle);
                        handle
                    }
                };
                if let Some(session) = self.sessions.get_mut(&handle) {
                    session.backend_throughputs.insert(node_id, throughput);
                }
                changed.insert(handle);
            }

            // Register declared standby roles and tell the primaries
            let backup_ids = self
                .backends
                .get(&node_id)
                .map(|b| b.backup_model_sessions())
                .unwrap_or_default();
            let backend_info = self
                .backends
                .get(&node_id)
                .map(|b| b.backend_info());
            for model_sess_id in backup_ids {
                let Some(&handle) = self.session_index.get(&model_sess_id) else {
                    error!(
                        session = %model_sess_id,
                        "Cannot find backup model session in the session table"
                    );
                    continue;
                };
                let Some(session) = self.sessions.get_mut(&handle) else {
                    continue;
                };
                if !session.backup_backends.insert(node_id) {
                    continue;
                }
                let primaries: Vec<u32> = session.backend_throughputs.keys().copied().collect();
                for primary_id in primaries {
                    if let (Some(primary), Some(info)) =
                        (self.backends.get_mut(&primary_id), backend_info.as_ref())
                    {
                        primary.add_backup_for_model(&model_sess_id, info.clone());
                    }
                }
            }
        } else {
            self.allocate_unassigned_workloads(now, &mut changed);
        }
        changed
    }

    /// Tear down a departed backend and rehome its workload
    fn remove_backend(
        &mut self,
        removed: BackendDelegate,
        now: Instant,
    ) -> BTreeSet<SessionHandle> {
        let mut changed = BTreeSet::new();
        if removed.is_idle() {
            return changed;
        }
        let model_sessions = removed.model_sessions();

        for model_sess_id in &model_sessions {
            let Some(&handle) = self.session_index.get(model_sess_id) else {
                continue;
            };
            if let Some(session) = self.sessions.get_mut(&handle) {
                session.backend_throughputs.remove(&removed.node_id());
                changed.insert(handle);
            }
        }

        // An idle peer with matching hardware can absorb the table whole
        let absorber = self.backends.iter_mut().find_map(|(&node_id, backend)| {
            if backend.is_idle() && backend.assign(&removed) {
                Some(node_id)
            } else {
                None
            }
        });

        if let Some(absorber_id) = absorber {
            for model_sess_id in &model_sessions {
                let throughput = self
                    .backends
                    .get(&absorber_id)
                    .map(|b| b.model_throughput(model_sess_id))
                    .unwrap_or(0.0);
                if let Some(&handle) = self.session_index.get(model_sess_id) {
                    if let Some(session) = self.sessions.get_mut(&handle) {
                        session.backend_throughputs.insert(absorber_id, throughput);
                    }
                }
            }
            if let Some(workload_id) = self
                .backends
                .get(&absorber_id)
                .and_then(|b| b.workload_id())
            {
                self.assigned_static_workloads.insert(workload_id, absorber_id);
                info!(
                    workload = workload_id,
                    backend = absorber_id,
                    "Reassign static workload"
                );
            }
            // Move standby memberships onto the absorber
            let absorber_info = self
                .backends
                .get(&absorber_id)
                .map(|b| b.backend_info());
            for model_sess_id in removed.backup_model_sessions() {
                let Some(&handle) = self.session_index.get(&model_sess_id) else {
                    continue;
                };
                let Some(session) = self.sessions.get_mut(&handle) else {
                    continue;
                };
                let removed_membership = session.backup_backends.remove(&removed.node_id());
                let inserted = session.backup_backends.insert(absorber_id);
                if !removed_membership && !inserted {
                    continue;
                }
                let primaries: Vec<u32> = session.backend_throughputs.keys().copied().collect();
                for primary_id in primaries {
                    if let (Some(primary), Some(info)) =
                        (self.backends.get_mut(&primary_id), absorber_info.as_ref())
                    {
                        primary.remove_backup_for_model(&model_sess_id, removed.node_id());
                        primary.add_backup_for_model(&model_sess_id, info.clone());
                    }
                }
            }
        } else {
            // No absorber: retire standby roles outright
            for model_sess_id in removed.backup_model_sessions() {
                let Some(&handle) = self.session_index.get(&model_sess_id) else {
                    continue;
                };
                let Some(session) = self.sessions.get_mut(&handle) else {
                    continue;
                };
                if !session.backup_backends.remove(&removed.node_id()) {
                    continue;
                }
                let primaries: Vec<u32> = session.backend_throughputs.keys().copied().collect();
                for primary_id in primaries {
                    if let Some(primary) = self.backends.get_mut(&primary_id) {
                        primary.remove_backup_for_model(&model_sess_id, removed.node_id());
                    }
                }
            }
            if let Some(workload_id) = removed.workload_id() {
                self.assigned_static_workloads.remove(&workload_id);
                info!(workload = workload_id, "Static workload slot freed");
            } else {
                // Spill lost throughput into unassigned overflow; prefix
                // groups share one instance, so count each record once
                let mut seen = HashSet::new();
                for model_sess_id in &model_sessions {
                    let Some(&handle) = self.session_index.get(model_sess_id) else {
                        continue;
                    };
                    if !seen.insert(handle) {
                        continue;
                    }
                    let throughput = removed.model_throughput(model_sess_id);
                    if let Some(session) = self.sessions.get_mut(&handle) {
                        session.unassigned_workload += throughput;
                    }
                }
                self.allocate_unassigned_workloads(now, &mut changed);
            }
        }
        changed
    }

    /// Tear down a departed frontend's subscriptions; sessions with no
    /// subscribers left and no static workload are removed everywhere
    fn remove_frontend(&mut self, frontend: FrontendDelegate) {
        for model_sess_id in frontend.subscribed_models() {
            let Some(subscribers) = self.session_subscribers.get_mut(model_sess_id) else {
                continue;
            };
            subscribers.remove(&frontend.node_id());
            if !subscribers.is_empty() {
                continue;
            }
            self.session_subscribers.remove(model_sess_id);
            let Some(&handle) = self.session_index.get(model_sess_id) else {
                continue;
            };
            let Some(session) = self.sessions.get_mut(&handle) else {
                continue;
            };
            if session.has_static_workload {
                continue;
            }
            info!(session = %model_sess_id, "Remove model session");
            session.remove_from_group(model_sess_id);
            let group_empty = session.model_sessions.is_empty();
            let backend_ids: Vec<u32> = session.backend_throughputs.keys().copied().collect();
            for node_id in backend_ids {
                if let Some(backend) = self.backends.get_mut(&node_id) {
                    backend.unload_model(model_sess_id);
                }
            }
            self.session_index.remove(model_sess_id);
            if group_empty {
                self.sessions.remove(&handle);
            }
        }
    }

    /// Place overflow workload, largest first, onto whichever backends
    /// still have headroom
    fn allocate_unassigned_workloads(
        &mut self,
        now: Instant,
        changed: &mut BTreeSet<SessionHandle>,
    ) {
        let mut pending: Vec<(SessionHandle, f64)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.unassigned_workload > 0.0)
            .map(|(&handle, s)| (handle, s.unassigned_workload))
            .collect();
        if pending.is_empty() {
            return;
        }
        pending.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        for (handle, _) in pending {
            let (mut rate, group) = {
                let Some(session) = self.sessions.get(&handle) else {
                    continue;
                };
                (session.unassigned_workload, session.model_sessions.clone())
            };
            let Some(head) = group.first().cloned() else {
                continue;
            };
            let head_id = head.session_id();
            while rate > 0.0 {
                let Some((node_id, inst)) =
                    self.find_best_backend(&head, rate, &BTreeSet::new(), now)
                else {
                    info!(session = %head_id, rate, "Unassigned workload remains");
                    break;
                };
                rate -= inst.throughput;
                let throughput = inst.throughput;
                if let Some(backend) = self.backends.get_mut(&node_id) {
                    backend.load_model(head.clone(), inst);
                    for peer in group.iter().skip(1) {
                        backend.load_prefix_model(peer.clone(), &head_id);
                    }
                }
                if let Some(session) = self.sessions.get_mut(&handle) {
                    session.backend_throughputs.insert(node_id, throughput);
                }
                changed.insert(handle);
            }
            if let Some(session) = self.sessions.get_mut(&handle) {
                session.unassigned_workload = rate.max(0.0);
            }
        }
    }

    /// Beacon tick: reap dead frontends, fold stats into RPS histories,
    /// reap dead backends
    pub fn beacon_check(&mut self, now: Instant) -> Vec<Outbound> {
        let mut changed = BTreeSet::new();

        // 1. Remove dead frontends
        let dead_frontends: Vec<u32> = self
            .frontends
            .iter()
            .filter(|(_, f)| !f.is_alive(now))
            .map(|(&id, _)| id)
            .collect();
        for node_id in dead_frontends {
            if let Some(frontend) = self.frontends.remove(&node_id) {
                info!(frontend = node_id, "Remove dead frontend");
                self.remove_frontend(frontend);
            }
        }

        // 2. Aggregate per-record RPS over every member session
        let handles: BTreeSet<SessionHandle> = self.session_index.values().copied().collect();
        for handle in handles {
            let rps = {
                let Some(session) = self.sessions.get(&handle) else {
                    continue;
                };
                let mut rps = 0.0;
                for node_id in session.backend_throughputs.keys() {
                    if let Some(backend) = self.backends.get(node_id) {
                        for sess in &session.model_sessions {
                            rps += backend.model_rps(&sess.session_id());
                        }
                    }
                }
                rps
            };
            if let Some(session) = self.sessions.get_mut(&handle) {
                // Don't record leading zeros
                if !session.rps_history.is_empty() || rps > 0.0 {
                    session.rps_history.push_back(rps);
                }
                while session.rps_history.len() > self.history_len {
                    session.rps_history.pop_front();
                }
                if let Some(head) = session.head() {
                    debug!(session = %head, rps, "Beacon rps sample");
                }
            }
        }

        // 3. Remove dead backends and rehome their workload
        let dead_backends: Vec<u32> = self
            .backends
            .iter()
            .filter(|(_, b)| !b.is_alive(now))
            .map(|(&id, _)| id)
            .collect();
        let mut removed = Vec::new();
        for node_id in dead_backends {
            if let Some(backend) = self.backends.remove(&node_id) {
                info!(backend = node_id, "Remove dead backend");
                removed.push(backend);
            }
        }
        for backend in removed {
            changed.extend(self.remove_backend(backend, now));
        }

        let mut outbound = self.drain_model_table_updates();
        outbound.extend(self.model_route_updates(&changed));
        outbound
    }

    /// Epoch tick: estimate each session's demand from its RPS history
    /// and rebalance allocations
    pub fn epoch_schedule(&mut self, now: Instant) -> Vec<Outbound> {
        let mut changed = BTreeSet::new();
        let mut overload_backends: BTreeSet<u32> = BTreeSet::new();
        debug!("Epoch schedule");

        let handles: BTreeSet<SessionHandle> = self.session_index.values().copied().collect();
        for handle in handles {
            let (throughput, mut estimate, head_id, backend_shares) = {
                let Some(session) = self.sessions.get(&handle) else {
                    continue;
                };
                if session.rps_history.len() < self.min_history_len {
                    continue;
                }
                let throughput = session.total_throughput();
                let (mean, std) = session.rps_mean_std();
                let last = session.rps_history.back().copied().unwrap_or(0.0);
                let estimate = (last + std).max(0.1);
                let Some(head) = session.head() else {
                    continue;
                };
                debug!(
                    session = %head,
                    estimate,
                    last,
                    mean,
                    std,
                    throughput,
                    "Epoch estimate"
                );
                let shares: Vec<(u32, f64)> = session
                    .backend_throughputs
                    .iter()
                    .map(|(&id, &tp)| (id, tp))
                    .collect();
                (throughput, estimate, head.session_id(), shares)
            };
            if let Some(session) = self.sessions.get_mut(&handle) {
                session.unassigned_workload = (estimate - throughput).max(0.0);
            }

            if estimate < throughput * 0.97 {
                // Demand shrank: release largest-throughput backends first.
                // Statically configured backends stay fixed.
                let mut adjust: Vec<(u32, f64)> = Vec::new();
                for &(node_id, share) in &backend_shares {
                    let is_static = self
                        .backends
                        .get(&node_id)
                        .map(|b| b.workload_id().is_some())
                        .unwrap_or(false);
                    if is_static {
                        estimate -= share;
                    } else {
                        adjust.push((node_id, share));
                    }
                }
                adjust.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
                for (node_id, share) in adjust {
                    if estimate <= 0.0 {
                        if let Some(backend) = self.backends.get_mut(&node_id) {
                            backend.unload_instance(&head_id);
                        }
                        if let Some(session) = self.sessions.get_mut(&handle) {
                            session.backend_throughputs.remove(&node_id);
                        }
                    } else if share > estimate {
                        let new_tp = {
                            let Self {
                                ref model_db,
                                ref mut backends,
                                ..
                            } = *self;
                            backends
                                .get_mut(&node_id)
                                .map(|b| b.update_model_throughput(model_db, &head_id, estimate))
                                .unwrap_or(0.0)
                        };
                        if let Some(session) = self.sessions.get_mut(&handle) {
                            session.backend_throughputs.insert(node_id, new_tp);
                        }
                        estimate -= new_tp;
                    } else {
                        estimate -= share;
                    }
                }
                changed.insert(handle);
            } else if estimate > throughput {
                // Demand grew: push existing non-static backends toward
                // their peaks before asking for new ones
                let mut adjust: Vec<(u32, f64)> = Vec::new();
                for &(node_id, share) in &backend_shares {
                    let is_static = self
                        .backends
                        .get(&node_id)
                        .map(|b| b.workload_id().is_some())
                        .unwrap_or(false);
                    if is_static {
                        estimate -= share;
                    } else {
                        adjust.push((node_id, share));
                    }
                }
                adjust.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
                for (node_id, _) in adjust {
                    let new_tp = {
                        let Self {
                            ref model_db,
                            ref mut backends,
                            ..
                        } = *self;
                        backends
                            .get_mut(&node_id)
                            .map(|b| b.update_model_throughput(model_db, &head_id, estimate))
                            .unwrap_or(0.0)
                    };
                    if let Some(session) = self.sessions.get_mut(&handle) {
                        session.backend_throughputs.insert(node_id, new_tp);
                    }
                    estimate -= new_tp;
                    if self
                        .backends
                        .get(&node_id)
                        .map(|b| b.overload())
                        .unwrap_or(false)
                    {
                        overload_backends.insert(node_id);
                    }
                }
                if let Some(session) = self.sessions.get_mut(&handle) {
                    session.unassigned_workload = estimate.max(0.0);
                }
                changed.insert(handle);
            }
        }

        // Overloaded backends shed their smallest instances
        for node_id in overload_backends {
            let spilled = self
                .backends
                .get_mut(&node_id)
                .map(|b| b.spill_out_workload())
                .unwrap_or_default();
            for (sessions, throughput) in spilled {
                let Some(head) = sessions.first() else {
                    continue;
                };
                let Some(&handle) = self.session_index.get(&head.session_id()) else {
                    continue;
                };
                if let Some(session) = self.sessions.get_mut(&handle) {
                    session.backend_throughputs.remove(&node_id);
                    session.unassigned_workload += throughput;
                }
                changed.insert(handle);
            }
        }

        self.allocate_unassigned_workloads(now, &mut changed);

        let mut outbound = self.drain_model_table_updates();
        outbound.extend(self.model_route_updates(&changed));
        self.display_model_table();
        outbound
    }

    /// Current route for a session id
    fn model_route(&self, model_sess_id: &str) -> Option<ModelRoute> {
        let handle = self.session_index.get(model_sess_id)?;
        let session = self.sessions.get(handle)?;
        let mut backends = Vec::new();
        for (node_id, &throughput) in &session.backend_throughputs {
            let Some(backend) = self.backends.get(node_id) else {
                error!(backend = node_id, "Route references unknown backend");
                continue;
            };
            backends.push(BackendRate {
                info: backend.backend_info(),
                throughput,
            });
        }
        Some(ModelRoute {
            model_session_id: model_sess_id.to_string(),
            backends,
        })
    }

    /// Batch fresh routes for every frontend subscribed to a changed
    /// session
    fn model_route_updates(&self, changed: &BTreeSet<SessionHandle>) -> Vec<Outbound> {
        let mut per_frontend: BTreeMap<u32, Vec<ModelRoute>> = BTreeMap::new();
        for handle in changed {
            let Some(session) = self.sessions.get(handle) else {
                continue;
            };
            for sess in &session.model_sessions {
                let model_sess_id = sess.session_id();
                let Some(subscribers) = self.session_subscribers.get(&model_sess_id) else {
                    continue;
                };
                let Some(route) = self.model_route(&model_sess_id) else {
                    continue;
                };
                for &frontend_id in subscribers {
                    per_frontend
                        .entry(frontend_id)
                        .or_default()
                        .push(route.clone());
                }
            }
        }
        per_frontend
            .into_iter()
            .filter_map(|(frontend_id, routes)| {
                let frontend = self.frontends.get(&frontend_id)?;
                Some(Outbound::ModelRoutes {
                    addr: frontend.rpc_addr(),
                    updates: ModelRouteUpdates { routes },
                })
            })
            .collect()
    }

    /// Collect pending model-table pushes from every dirty delegate
    fn drain_model_table_updates(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for backend in self.backends.values_mut() {
            if let Some(update) = backend.take_pending_update() {
                outbound.push(Outbound::ModelTable {
                    addr: backend.rpc_addr(),
                    update,
                });
            }
        }
        outbound
    }

    fn display_model_table(&self) {
        for (model_sess_id, handle) in &self.session_index {
            let Some(session) = self.sessions.get(handle) else {
                continue;
            };
            let placements: Vec<String> = session
                .backend_throughputs
                .iter()
                .map(|(node_id, tp)| {
                    let batch = self
                        .backends
                        .get(node_id)
                        .and_then(|b| b.instance_batch(model_sess_id))
                        .unwrap_or(0);
                    format!("{}/{:.1}/{}", node_id, tp, batch)
                })
                .collect();
            debug!(session = %model_sess_id, placements = %placements.join(" "), "Model table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_proto::ModelStats;

    const DB_YAML: &str = r#"
models:
  - framework: tensorflow
    model_name: resnet50
    version: 1
    memory_mb: 1024
    prefix_share: resnet
    profiles:
      - gpu_device: mock-gpu
        forward_latency_us: [2000, 3200, 5000, 6600, 8300, 10000, 11600, 13300]
  - framework: tensorflow
    model_name: resnet152
    version: 1
    memory_mb: 2048
    prefix_share: resnet
    profiles:
      - gpu_device: mock-gpu
        forward_latency_us: [6000, 11000, 16000, 21000]
  - framework: caffe2
    model_name: mobilenet
    version: 1
    memory_mb: 256
    profiles:
      - gpu_device: mock-gpu
        forward_latency_us: [2000, 3500, 5000, 6500]
  - framework: tensorflow
    model_name: ssd
    version: 1
    resizable: true
    image_height: 300
    image_width: 300
    memory_mb: 512
    profiles:
      - gpu_device: mock-gpu
        forward_latency_us: [4000, 7000, 10000, 13000]
"#;

    // resnet50 under a 100 ms SLA: batch 7 (7 * 11.6 ms = 81.2 ms),
    // peak throughput 7e6 / 11600 ~= 603.4 req/s
    const RESNET_PEAK: f64 = 7.0 * 1e6 / 11600.0;

    fn scheduler_with(workloads: Vec<Vec<WorkloadEntry>>) -> Scheduler {
        let config = SchedulerConfig::default();
        let db = ModelDatabase::from_yaml(DB_YAML).unwrap();
        Scheduler::new(&config, db, workloads)
    }

    fn scheduler() -> Scheduler {
        scheduler_with(Vec::new())
    }

    fn register_backend(s: &mut Scheduler, node_id: u32, now: Instant) -> Vec<Outbound> {
        let (reply, outbound) = s.register(
            RegisterRequest {
                node_id,
                node_type: NodeType::Backend,
                server_port: 8001,
                rpc_port: 8002,
                gpu_device_name: Some("mock-gpu".to_string()),
                gpu_available_memory_mb: Some(8192),
            },
            "127.0.0.1".to_string(),
            now,
        );
        assert_eq!(reply.status, CtrlStatus::Ok);
        outbound
    }

    fn register_frontend(s: &mut Scheduler, node_id: u32, now: Instant) {
        let (reply, _) = s.register(
            RegisterRequest {
                node_id,
                node_type: NodeType::Frontend,
                server_port: 9001,
                rpc_port: 9002,
                gpu_device_name: None,
                gpu_available_memory_mb: None,
            },
            "127.0.0.1".to_string(),
            now,
        );
        assert_eq!(reply.status, CtrlStatus::Ok);
    }

    fn load_model(
        s: &mut Scheduler,
        frontend_id: u32,
        session: ModelSession,
        workload: f64,
        now: Instant,
    ) -> (LoadModelReply, Vec<Outbound>) {
        s.load_model(
            LoadModelRequest {
                node_id: frontend_id,
                model_session: session,
                estimate_workload: workload,
            },
            now,
        )
    }

    /// Every session id in any backend's model table must be indexed
    fn assert_session_table_closure(s: &Scheduler) {
        for backend in s.backends.values() {
            for model_sess_id in backend.model_sessions() {
                assert!(
                    s.session_index.contains_key(&model_sess_id),
                    "session {} missing from session table",
                    model_sess_id
                );
            }
        }
    }

    #[test]
    fn test_single_backend_discovery_load() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let (reply, _) = load_model(&mut s, 100, sess.clone(), 0.0, now);
        assert_eq!(reply.status, CtrlStatus::Ok);
        let route = reply.model_route.unwrap();
        assert_eq!(route.backends.len(), 1);
        assert!(route.backends[0].throughput > 0.0);
        assert_session_table_closure(&s);
    }

    #[test]
    fn test_two_backend_split_covers_workload() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_backend(&mut s, 2, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let (reply, _) = load_model(&mut s, 100, sess.clone(), 1000.0, now);
        assert_eq!(reply.status, CtrlStatus::Ok);
        let route = reply.model_route.unwrap();
        assert_eq!(route.backends.len(), 2);
        let total: f64 = route.backends.iter().map(|b| b.throughput).sum();
        assert!(total >= 1000.0 - 1e-6);
        assert_session_table_closure(&s);
    }

    #[test]
    fn test_not_enough_backends_leaves_state_unchanged() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_backend(&mut s, 2, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        // Two backends peak at ~603 req/s each; 2000 cannot be covered
        let (reply, outbound) = load_model(&mut s, 100, sess.clone(), 2000.0, now);
        assert_eq!(reply.status, CtrlStatus::NotEnoughBackends);
        assert!(outbound.is_empty());
        assert!(s.session_info(&sess.session_id()).is_none());
        assert!(s.backend(1).unwrap().is_idle());
        assert!(s.backend(2).unwrap().is_idle());
    }

    #[test]
    fn test_duplicate_register_conflicts() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);

        let (reply, outbound) = s.register(
            RegisterRequest {
                node_id: 1,
                node_type: NodeType::Backend,
                server_port: 8003,
                rpc_port: 8004,
                gpu_device_name: Some("other-gpu".to_string()),
                gpu_available_memory_mb: Some(1),
            },
            "127.0.0.2".to_string(),
            now,
        );
        assert_eq!(reply.status, CtrlStatus::BackendNodeIdConflict);
        assert!(outbound.is_empty());
        // Original registration untouched
        assert_eq!(s.backend(1).unwrap().gpu_device(), "mock-gpu");

        register_frontend(&mut s, 100, now);
        let (reply, _) = s.register(
            RegisterRequest {
                node_id: 100,
                node_type: NodeType::Frontend,
                server_port: 9001,
                rpc_port: 9002,
                gpu_device_name: None,
                gpu_available_memory_mb: None,
            },
            "127.0.0.1".to_string(),
            now,
        );
        assert_eq!(reply.status, CtrlStatus::FrontendNodeIdConflict);
    }

    #[test]
    fn test_load_model_requires_registered_frontend() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let (reply, _) = load_model(&mut s, 42, sess, 100.0, now);
        assert_eq!(reply.status, CtrlStatus::ServerNotRegistered);
    }

    #[test]
    fn test_load_model_unknown_model() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);
        let sess = ModelSession::new("tensorflow", "unknown", 1, 100);
        let (reply, _) = load_model(&mut s, 100, sess, 100.0, now);
        assert_eq!(reply.status, CtrlStatus::ModelNotFound);
    }

    #[test]
    fn test_resizable_model_acquires_default_dims() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "ssd", 1, 200);
        let (reply, _) = load_model(&mut s, 100, sess, 0.0, now);
        assert_eq!(reply.status, CtrlStatus::Ok);
        let route = reply.model_route.unwrap();
        assert_eq!(route.model_session_id, "tensorflow:ssd:1:200:300x300");
        assert!(s.session_info("tensorflow:ssd:1:200:300x300").is_some());
    }

    #[test]
    fn test_dead_backend_removed_and_route_pushed() {
        let t0 = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, t0);
        register_backend(&mut s, 2, t0);
        register_frontend(&mut s, 100, t0);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        let (reply, _) = load_model(&mut s, 100, sess, 1000.0, t0);
        assert_eq!(reply.status, CtrlStatus::Ok);

        // Backend 2 and the frontend stay alive; backend 1 goes silent
        let t1 = t0 + Duration::from_secs(5);
        s.update_backend_stats(
            BackendStats {
                node_id: 2,
                model_stats: vec![],
            },
            t1,
        );
        s.keep_alive(KeepAliveRequest { node_id: 100 }, t1);

        let outbound = s.beacon_check(t1);
        assert!(s.backend(1).is_none());

        let info = s.session_info(&sess_id).unwrap();
        assert!(!info.backend_throughputs.contains_key(&1));

        // The frontend must receive a route omitting the dead backend
        let route_update = outbound.iter().find_map(|o| match o {
            Outbound::ModelRoutes { updates, .. } => Some(updates),
            _ => None,
        });
        let updates = route_update.expect("route update pushed to frontend");
        let route = updates
            .routes
            .iter()
            .find(|r| r.model_session_id == sess_id)
            .unwrap();
        assert!(route.backends.iter().all(|b| b.info.node_id != 1));
    }

    #[test]
    fn test_static_workload_assignment() {
        let now = Instant::now();
        let workloads = vec![vec![WorkloadEntry {
            framework: "caffe2".to_string(),
            model_name: "mobilenet".to_string(),
            version: 1,
            latency_sla_ms: 50,
            image_height: 0,
            image_width: 0,
            backup: false,
        }]];
        let mut s = scheduler_with(workloads);

        let outbound = register_backend(&mut s, 1, now);
        // The new backend immediately receives a model table carrying the
        // static session
        let table = outbound.iter().find_map(|o| match o {
            Outbound::ModelTable { update, .. } => Some(update),
            _ => None,
        });
        let table = table.expect("model table pushed to backend");
        assert_eq!(table.model_instances.len(), 1);
        assert_eq!(
            table.model_instances[0].sessions[0].session_id(),
            "caffe2:mobilenet:1:50"
        );

        let info = s.session_info("caffe2:mobilenet:1:50").unwrap();
        assert!(info.has_static_workload);
        assert!(info.backend_throughputs.contains_key(&1));

        // Static sessions survive their last subscriber
        register_frontend(&mut s, 100, now);
        let sess = ModelSession::new("caffe2", "mobilenet", 1, 50);
        let (reply, _) = load_model(&mut s, 100, sess, 0.0, now);
        assert_eq!(reply.status, CtrlStatus::Ok);
        s.unregister(
            UnregisterRequest {
                node_id: 100,
                node_type: NodeType::Frontend,
            },
            now,
        );
        assert!(s.session_info("caffe2:mobilenet:1:50").is_some());
        assert!(s.backend(1).unwrap().has_session("caffe2:mobilenet:1:50"));
    }

    #[test]
    fn test_static_slot_not_reused() {
        let now = Instant::now();
        let workloads = vec![vec![WorkloadEntry {
            framework: "caffe2".to_string(),
            model_name: "mobilenet".to_string(),
            version: 1,
            latency_sla_ms: 50,
            image_height: 0,
            image_width: 0,
            backup: false,
        }]];
        let mut s = scheduler_with(workloads);
        register_backend(&mut s, 1, now);
        register_backend(&mut s, 2, now);

        // Only one slot exists; exactly one backend holds it
        assert_eq!(s.assigned_static_workloads.len(), 1);
        assert_eq!(s.backend(1).unwrap().workload_id(), Some(0));
        assert_eq!(s.backend(2).unwrap().workload_id(), None);
    }

    #[test]
    fn test_prefix_batching_joins_existing_session() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let a = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let a_id = a.session_id();
        let (reply, _) = load_model(&mut s, 100, a, 100.0, now);
        assert_eq!(reply.status, CtrlStatus::Ok);

        let b = ModelSession::new("tensorflow", "resnet152", 1, 100);
        let b_id = b.session_id();
        let (reply, outbound) = load_model(&mut s, 100, b, 0.0, now);
        assert_eq!(reply.status, CtrlStatus::Ok);

        // No new instance: backend 1 serves both sessions from one entry
        let backend = s.backend(1).unwrap();
        assert!(backend.has_session(&a_id));
        assert!(backend.has_session(&b_id));
        let route = reply.model_route.unwrap();
        assert_eq!(route.backends.len(), 1);

        // Both ids alias one record
        let info = s.session_info(&b_id).unwrap();
        assert_eq!(info.model_sessions.len(), 2);
        assert!(s.subscribers(&a_id).unwrap().contains(&100));
        assert!(s.subscribers(&b_id).unwrap().contains(&100));

        // The owning backend was told about the new prefix model
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::ModelTable { .. })));
        assert_session_table_closure(&s);
    }

    #[test]
    fn test_epoch_grows_allocation_from_history() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        let (reply, _) = load_model(&mut s, 100, sess, 150.0, now);
        assert_eq!(reply.status, CtrlStatus::Ok);

        // Synthetic demand history climbing past the 150 req/s allocation
        let handle = *s.session_index.get(&sess_id).unwrap();
        s.sessions
            .get_mut(&handle)
            .unwrap()
            .rps_history
            .extend([0.0, 0.0, 100.0, 120.0, 150.0, 200.0, 220.0]);

        s.epoch_schedule(now);

        let info = s.session_info(&sess_id).unwrap();
        let grown = info.total_throughput() > 150.0;
        let has_overflow = info.unassigned_workload > 0.0;
        assert!(grown || has_overflow);
        // Demand estimate stays within the single backend's peak here, so
        // the allocation must actually grow
        assert!(info.total_throughput() <= RESNET_PEAK + 1e-6);
        assert_session_table_closure(&s);
    }

    #[test]
    fn test_epoch_shrinks_allocation() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_backend(&mut s, 2, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        let (reply, _) = load_model(&mut s, 100, sess, 1000.0, now);
        assert_eq!(reply.status, CtrlStatus::Ok);

        // Demand collapsed to ~50 req/s
        let handle = *s.session_index.get(&sess_id).unwrap();
        s.sessions
            .get_mut(&handle)
            .unwrap()
            .rps_history
            .extend([50.0, 50.0, 50.0, 50.0, 50.0]);

        s.epoch_schedule(now);

        let info = s.session_info(&sess_id).unwrap();
        // One backend released entirely, the other trimmed near demand
        assert_eq!(info.backend_throughputs.len(), 1);
        assert!(info.total_throughput() < 100.0);
        assert_session_table_closure(&s);
    }

    #[test]
    fn test_rps_history_stays_bounded() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        load_model(&mut s, 100, sess, 100.0, now);

        for i in 0..30u64 {
            let t = now + Duration::from_secs(i);
            s.update_backend_stats(
                BackendStats {
                    node_id: 1,
                    model_stats: vec![ModelStats {
                        model_session_id: sess_id.clone(),
                        rps: 80.0,
                        drop_rate: 0.0,
                        queue_length: 0,
                    }],
                },
                t,
            );
            s.keep_alive(KeepAliveRequest { node_id: 100 }, t);
            s.beacon_check(t);
        }
        let info = s.session_info(&sess_id).unwrap();
        assert!(info.rps_history.len() <= s.history_len);
        assert_eq!(s.history_len, 10);
    }

    #[test]
    fn test_beacon_suppresses_leading_zero_samples() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        load_model(&mut s, 100, sess, 100.0, now);

        s.keep_alive(KeepAliveRequest { node_id: 100 }, now);
        s.update_backend_stats(
            BackendStats {
                node_id: 1,
                model_stats: vec![],
            },
            now,
        );
        s.beacon_check(now);
        assert!(s.session_info(&sess_id).unwrap().rps_history.is_empty());
    }

    #[test]
    fn test_remove_last_subscriber_unloads_session() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);
        register_frontend(&mut s, 101, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        load_model(&mut s, 100, sess.clone(), 100.0, now);
        load_model(&mut s, 101, sess, 100.0, now);

        s.unregister(
            UnregisterRequest {
                node_id: 100,
                node_type: NodeType::Frontend,
            },
            now,
        );
        // One subscriber remains; the session stays
        assert!(s.session_info(&sess_id).is_some());

        let (_, outbound) = s.unregister(
            UnregisterRequest {
                node_id: 101,
                node_type: NodeType::Frontend,
            },
            now,
        );
        assert!(s.session_info(&sess_id).is_none());
        assert!(!s.backend(1).unwrap().has_session(&sess_id));
        // The backend was told to drop the model
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::ModelTable { .. })));
    }

    #[test]
    fn test_unregister_backend_spills_to_unassigned() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        load_model(&mut s, 100, sess, 100.0, now);

        s.unregister(
            UnregisterRequest {
                node_id: 1,
                node_type: NodeType::Backend,
            },
            now,
        );
        let info = s.session_info(&sess_id).unwrap();
        assert!(info.backend_throughputs.is_empty());
        assert!(info.unassigned_workload >= 100.0 - 1e-6);
    }

    #[test]
    fn test_idle_backend_absorbs_departing_workload() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        load_model(&mut s, 100, sess, 100.0, now);

        // Register an idle twin, then lose the loaded backend
        register_backend(&mut s, 2, now);
        let (_, outbound) = s.unregister(
            UnregisterRequest {
                node_id: 1,
                node_type: NodeType::Backend,
            },
            now,
        );
        let info = s.session_info(&sess_id).unwrap();
        assert!(info.backend_throughputs.contains_key(&2));
        assert!(s.backend(2).unwrap().has_session(&sess_id));
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::ModelTable { .. })));
    }

    #[test]
    fn test_new_backend_drains_unassigned_workload() {
        let now = Instant::now();
        let mut s = scheduler();
        register_backend(&mut s, 1, now);
        register_frontend(&mut s, 100, now);

        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let sess_id = sess.session_id();
        load_model(&mut s, 100, sess, 100.0, now);
        s.unregister(
            UnregisterRequest {
                node_id: 1,
                node_type: NodeType::Backend,
            },
            now,
        );
        assert!(s.session_info(&sess_id).unwrap().unassigned_workload > 0.0);

        let outbound = register_backend(&mut s, 2, now);
        let info = s.session_info(&sess_id).unwrap();
        assert!(info.unassigned_workload <= 1e-6);
        assert!(info.backend_throughputs.contains_key(&2));
        // Both a model table and a fresh route go out
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::ModelTable { .. })));
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::ModelRoutes { .. })));
    }
}
