//! Scheduler-side proxy for one backend node
//!
//! The delegate owns everything the scheduler knows about a backend: its
//! model table, throughput bookkeeping, liveness timestamp, and whether a
//! model-table push is pending. The capacity planner lives here too, since
//! feasibility is a per-backend question (profile curve on this GPU, free
//! memory, occupancy headroom).

use nexus_core::{BackendInfo, InstanceInfo, ModelDatabase, ModelSession};
use nexus_proto::{BackendStats, ModelInstanceConfig, ModelTableUpdate, SessionBackups};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A backend is overloaded once its summed duty cycle exceeds this
const OVERLOAD_THRESHOLD: f64 = 1.0 + 1e-6;

/// One model instance on the backend: the session group sharing it (head
/// first) and the planned placement
#[derive(Debug, Clone)]
pub struct ModelInstanceEntry {
    pub sessions: Vec<ModelSession>,
    pub instance: InstanceInfo,
}

impl ModelInstanceEntry {
    fn contains(&self, model_sess_id: &str) -> bool {
        self.sessions.iter().any(|s| s.session_id() == model_sess_id)
    }
}

/// Scheduler-side state for one backend node
#[derive(Debug, Clone)]
pub struct BackendDelegate {
    node_id: u32,
    ip: String,
    server_port: u16,
    rpc_port: u16,
    gpu_device: String,
    gpu_available_memory_mb: u64,
    beacon_interval: Duration,

    /// Model instances this backend runs, one entry per instance
    model_table: Vec<ModelInstanceEntry>,

    /// Sessions this backend stands by for (declared by its static
    /// workload), by session id
    backup_session_ids: BTreeSet<String>,

    /// Backup backends for this backend's primary sessions
    backup_models: BTreeMap<String, Vec<BackendInfo>>,

    /// Most recent per-session request rates reported by the node
    model_rps: BTreeMap<String, f64>,

    last_alive: Instant,
    workload_id: Option<usize>,

    /// A model-table push is pending
    dirty: bool,
}

impl BackendDelegate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: u32,
        ip: impl Into<String>,
        server_port: u16,
        rpc_port: u16,
        gpu_device: impl Into<String>,
        gpu_available_memory_mb: u64,
        beacon_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            node_id,
            ip: ip.into(),
            server_port,
            rpc_port,
            gpu_device: gpu_device.into(),
            gpu_available_memory_mb,
            beacon_interval,
            model_table: Vec::new(),
            backup_session_ids: BTreeSet::new(),
            backup_models: BTreeMap::new(),
            model_rps: BTreeMap::new(),
            last_alive: now,
            workload_id: None,
            dirty: false,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn gpu_device(&self) -> &str {
        &self.gpu_device
    }

    /// Static workload slot assigned to this backend, if any
    pub fn workload_id(&self) -> Option<usize> {
        self.workload_id
    }

    pub fn set_workload_id(&mut self, id: usize) {
        self.workload_id = Some(id);
    }

    /// Addressing info published in routes
    pub fn backend_info(&self) -> BackendInfo {
        BackendInfo {
            node_id: self.node_id,
            ip: self.ip.clone(),
            server_port: self.server_port,
            rpc_port: self.rpc_port,
        }
    }

    /// Address control pushes are sent to
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.ip, self.rpc_port)
    }

    /// Record a sign of life
    pub fn tick(&mut self, now: Instant) {
        self.last_alive = now;
    }

    pub fn last_alive(&self) -> Instant {
        self.last_alive
    }

    /// Alive while the last sign of life is younger than two beacons
    pub fn is_alive(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_alive) < self.beacon_interval * 2
    }

    /// Idle: nothing loaded and no static workload slot
    pub fn is_idle(&self) -> bool {
        self.model_table.is_empty() && self.workload_id.is_none()
    }

    /// Summed duty cycle of all instances
    pub fn occupied(&self) -> f64 {
        self.model_table.iter().map(|e| e.instance.occupancy).sum()
    }

    /// Summed memory footprint of all instances, in megabytes
    pub fn used_memory_mb(&self) -> u64 {
        self.model_table.iter().map(|e| e.instance.memory_mb).sum()
    }

    /// Whether the duty cycle has been pushed past capacity
    pub fn overload(&self) -> bool {
        self.occupied() > OVERLOAD_THRESHOLD
    }

    fn find_entry(&self, model_sess_id: &str) -> Option<&ModelInstanceEntry> {
        self.model_table.iter().find(|e| e.contains(model_sess_id))
    }

    fn find_entry_idx(&self, model_sess_id: &str) -> Option<usize> {
        self.model_table.iter().position(|e| e.contains(model_sess_id))
    }

    /// Whether any instance serves the given session id
    pub fn has_session(&self, model_sess_id: &str) -> bool {
        self.find_entry(model_sess_id).is_some()
    }

    /// All session ids across all instances, prefix peers included
    pub fn model_sessions(&self) -> Vec<String> {
        self.model_table
            .iter()
            .flat_map(|e| e.sessions.iter().map(|s| s.session_id()))
            .collect()
    }

    /// Session ids this backend stands by for
    pub fn backup_model_sessions(&self) -> Vec<String> {
        self.backup_session_ids.iter().cloned().collect()
    }

    /// Declare this backend a standby for a session
    pub fn add_backup_session(&mut self, model_sess_id: impl Into<String>) {
        self.backup_session_ids.insert(model_sess_id.into());
    }

    /// Throughput currently planned for a session (0 if absent)
    pub fn model_throughput(&self, model_sess_id: &str) -> f64 {
        self.find_entry(model_sess_id)
            .map(|e| e.instance.throughput)
            .unwrap_or(0.0)
    }

    /// Batch size planned for a session, if loaded
    pub fn instance_batch(&self, model_sess_id: &str) -> Option<u32> {
        self.find_entry(model_sess_id).map(|e| e.instance.batch)
    }

    /// Latest reported request rate for a session (0 if none reported)
    pub fn model_rps(&self, model_sess_id: &str) -> f64 {
        self.model_rps.get(model_sess_id).copied().unwrap_or(0.0)
    }

    /// Merge a stats report and refresh liveness
    pub fn update_stats(&mut self, stats: &BackendStats, now: Instant) {
        for sample in &stats.model_stats {
            self.model_rps
                .insert(sample.model_session_id.clone(), sample.rps);
        }
        self.tick(now);
    }

    /// Capacity planner: can this backend host `session` at `target_rate`?
    ///
    /// Picks the largest batch whose duty cycle fits the session's latency
    /// SLA, then checks memory and occupancy headroom. Returns the planned
    /// instance and the backend's occupancy after loading it, or `None`
    /// when no feasible batch exists. A target rate of zero asks for the
    /// maximum achievable rate.
    pub fn prepare_load_model(
        &self,
        db: &ModelDatabase,
        session: &ModelSession,
        target_rate: f64,
    ) -> Option<(InstanceInfo, f64)> {
        if self.has_session(&session.session_id()) {
            return None;
        }
        let info = db.get(&session.model_id())?;
        let profile = info.profile(&self.gpu_device)?;
        let max_batch = profile.max_batch_under_sla(session.latency_sla_ms)?;
        let peak = profile.throughput(max_batch)?;
        if self.used_memory_mb() + info.memory_mb > self.gpu_available_memory_mb {
            return None;
        }
        let headroom = 1.0 - self.occupied();
        if headroom <= 0.0 {
            return None;
        }
        let achievable = peak * headroom;
        let throughput = if target_rate > 0.0 {
            target_rate.min(achievable)
        } else {
            achievable
        };
        if throughput <= 0.0 {
            return None;
        }
        let instance = InstanceInfo {
            batch: max_batch,
            max_batch,
            throughput,
            memory_mb: info.memory_mb,
            occupancy: throughput / peak,
        };
        let occupancy_after = (self.occupied() + instance.occupancy).min(1.0);
        Some((instance, occupancy_after))
    }

    /// Load a planned instance for a single session
    pub fn load_model(&mut self, session: ModelSession, instance: InstanceInfo) {
        debug!(
            backend = self.node_id,
            session = %session,
            throughput = instance.throughput,
            batch = instance.batch,
            "Load model"
        );
        self.model_table.push(ModelInstanceEntry {
            sessions: vec![session],
            instance,
        });
        self.dirty = true;
    }

    /// Load a session from a static workload at the maximum achievable
    /// rate. Returns false when the planner rejects it.
    pub fn load_static_model(&mut self, db: &ModelDatabase, session: ModelSession) -> bool {
        match self.prepare_load_model(db, &session, 0.0) {
            Some((instance, _)) => {
                self.load_model(session, instance);
                true
            }
            None => {
                warn!(
                    backend = self.node_id,
                    session = %session,
                    "Static workload session does not fit this backend"
                );
                false
            }
        }
    }

    /// Attach a prefix-sharing session to the instance already serving
    /// `share_sess_id`
    pub fn load_prefix_model(&mut self, session: ModelSession, share_sess_id: &str) {
        let Some(idx) = self.find_entry_idx(share_sess_id) else {
            warn!(
                backend = self.node_id,
                share = share_sess_id,
                "Cannot find shared instance for prefix model"
            );
            return;
        };
        let entry = &mut self.model_table[idx];
        if !entry.contains(&session.session_id()) {
            debug!(
                backend = self.node_id,
                session = %session,
                share = share_sess_id,
                "Load prefix model"
            );
            entry.sessions.push(session);
            self.dirty = true;
        }
    }

    /// Remove one session; the shared instance survives while peers
    /// remain, and the next peer becomes the head
    pub fn unload_model(&mut self, model_sess_id: &str) {
        let Some(idx) = self.find_entry_idx(model_sess_id) else {
            return;
        };
        let entry = &mut self.model_table[idx];
        if entry.sessions.len() > 1 {
            entry.sessions.retain(|s| s.session_id() != model_sess_id);
        } else {
            self.model_table.remove(idx);
        }
        self.dirty = true;
    }

    /// Remove the entire instance (all grouped sessions) serving a session
    pub fn unload_instance(&mut self, model_sess_id: &str) {
        if let Some(idx) = self.find_entry_idx(model_sess_id) {
            self.model_table.remove(idx);
            self.dirty = true;
        }
    }

    /// Re-plan an instance for a new target rate and return the achievable
    /// throughput. Unlike initial placement this may overcommit the duty
    /// cycle; the epoch loop detects the overload and spills out.
    pub fn update_model_throughput(
        &mut self,
        db: &ModelDatabase,
        model_sess_id: &str,
        target_rate: f64,
    ) -> f64 {
        let Some(idx) = self.find_entry_idx(model_sess_id) else {
            return 0.0;
        };
        let head = self.model_table[idx].sessions[0].clone();
        let plan = db
            .get(&head.model_id())
            .and_then(|info| info.profile(&self.gpu_device))
            .and_then(|profile| {
                let max_batch = profile.max_batch_under_sla(head.latency_sla_ms)?;
                Some((max_batch, profile.throughput(max_batch)?))
            });
        let Some((max_batch, peak)) = plan else {
            warn!(
                backend = self.node_id,
                session = %head,
                "No profile for loaded instance; keeping current plan"
            );
            return self.model_table[idx].instance.throughput;
        };
        let new_tp = target_rate.max(0.0).min(peak);
        let entry = &mut self.model_table[idx];
        entry.instance.batch = max_batch;
        entry.instance.max_batch = max_batch;
        entry.instance.throughput = new_tp;
        entry.instance.occupancy = new_tp / peak;
        self.dirty = true;
        new_tp
    }

    /// Release lowest-throughput instances until the duty cycle fits
    /// again. Returns the released (session group, throughput) pairs.
    pub fn spill_out_workload(&mut self) -> Vec<(Vec<ModelSession>, f64)> {
        let mut spilled = Vec::new();
        while self.overload() && !self.model_table.is_empty() {
            let idx = self
                .model_table
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.instance
                        .throughput
                        .partial_cmp(&b.instance.throughput)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            let entry = self.model_table.remove(idx);
            debug!(
                backend = self.node_id,
                session = %entry.sessions[0],
                throughput = entry.instance.throughput,
                "Spill out workload"
            );
            spilled.push((entry.sessions, entry.instance.throughput));
            self.dirty = true;
        }
        spilled
    }

    /// Absorb another backend's workload wholesale. Succeeds only when
    /// this backend is idle, runs the same GPU device, and has the memory.
    pub fn assign(&mut self, other: &BackendDelegate) -> bool {
        if !self.is_idle() {
            return false;
        }
        if self.gpu_device != other.gpu_device {
            return false;
        }
        if other.used_memory_mb() > self.gpu_available_memory_mb {
            return false;
        }
        self.model_table = other.model_table.clone();
        self.backup_session_ids = other.backup_session_ids.clone();
        self.backup_models = other.backup_models.clone();
        self.workload_id = other.workload_id;
        self.dirty = true;
        true
    }

    /// Record a standby backend for one of this backend's sessions
    pub fn add_backup_for_model(&mut self, model_sess_id: &str, info: BackendInfo) {
        let backups = self.backup_models.entry(model_sess_id.to_string()).or_default();
        if !backups.iter().any(|b| b.node_id == info.node_id) {
            backups.push(info);
            self.dirty = true;
        }
    }

    /// Drop a standby backend for one of this backend's sessions
    pub fn remove_backup_for_model(&mut self, model_sess_id: &str, node_id: u32) {
        if let Some(backups) = self.backup_models.get_mut(model_sess_id) {
            let before = backups.len();
            backups.retain(|b| b.node_id != node_id);
            if backups.len() != before {
                self.dirty = true;
            }
        }
    }

    /// Take the pending model-table push, if one is due
    pub fn take_pending_update(&mut self) -> Option<ModelTableUpdate> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(ModelTableUpdate {
            model_instances: self
                .model_table
                .iter()
                .map(|e| ModelInstanceConfig {
                    sessions: e.sessions.clone(),
                    instance: e.instance.clone(),
                })
                .collect(),
            session_backups: self
                .backup_models
                .iter()
                .map(|(id, backups)| SessionBackups {
                    model_session_id: id.clone(),
                    backups: backups.clone(),
                })
                .collect(),
        })
    }
}
