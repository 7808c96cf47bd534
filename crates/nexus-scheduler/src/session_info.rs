//! Global placement records for model sessions

use nexus_core::ModelSession;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Handle into the scheduler's session arena.
///
/// Several session ids can point at the same record when their models
/// share a prefix; the arena-plus-index layout makes that aliasing
/// explicit instead of hiding it behind shared pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

/// Placement record for one model session group
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Sessions sharing this placement: the head first, prefix-shared
    /// peers after it
    pub model_sessions: Vec<ModelSession>,

    /// Backend node id -> throughput assigned to it (req/s)
    pub backend_throughputs: BTreeMap<u32, f64>,

    /// Backends standing by for this session
    pub backup_backends: BTreeSet<u32>,

    /// Recent per-beacon RPS samples, oldest first
    pub rps_history: VecDeque<f64>,

    /// Overflow req/s not yet placed on any backend
    pub unassigned_workload: f64,

    /// Whether a static workload introduced this session; static sessions
    /// outlive their subscribers
    pub has_static_workload: bool,
}

impl SessionInfo {
    /// Create a record for a single session
    pub fn new(session: ModelSession) -> Self {
        Self {
            model_sessions: vec![session],
            ..Default::default()
        }
    }

    /// Total throughput currently assigned across backends
    pub fn total_throughput(&self) -> f64 {
        self.backend_throughputs.values().sum()
    }

    /// The head session of the group, if any
    pub fn head(&self) -> Option<&ModelSession> {
        self.model_sessions.first()
    }

    /// Drop one session from the group by id
    pub fn remove_from_group(&mut self, model_sess_id: &str) {
        self.model_sessions
            .retain(|s| s.session_id() != model_sess_id);
    }

    /// Mean and sample standard deviation of the RPS history
    pub fn rps_mean_std(&self) -> (f64, f64) {
        let n = self.rps_history.len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let mean = self.rps_history.iter().sum::<f64>() / n as f64;
        if n < 2 {
            return (mean, 0.0);
        }
        let var = self
            .rps_history
            .iter()
            .map(|rps| (rps - mean) * (rps - mean))
            .sum::<f64>()
            / (n - 1) as f64;
        (mean, var.sqrt())
    }
}
