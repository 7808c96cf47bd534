//! Model instances and the framework adapter seam
//!
//! The actual tensor kernels are external collaborators; everything the
//! pipeline needs from them sits behind [`ModelFramework`]. The mock
//! implementation echoes inputs with a configurable delay and failure
//! marker, which is enough to exercise the whole pipeline.

use crate::{BackendError, Result};
use async_trait::async_trait;
use nexus_core::{InstanceInfo, ModelSession};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Framework-specific model operations, invoked by workers (pre/post) and
/// the GPU executor (forward)
#[async_trait]
pub trait ModelFramework: Send + Sync {
    /// Framework name, e.g. "tensorflow"
    fn framework(&self) -> &str;

    /// Turn a raw input blob into a prepared tensor
    async fn preprocess(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Run the forward pass over a batch of prepared tensors
    async fn forward(&self, inputs: &[Vec<u8>]) -> Result<Vec<Vec<u8>>>;

    /// Turn a raw output tensor into a reply blob
    async fn postprocess(&self, output: &[u8]) -> Result<Vec<u8>>;
}

/// Mock framework: echoes inputs after a configurable delay.
///
/// Inputs whose first byte equals the failure marker fail preprocess,
/// which is how tests exercise the error path.
pub struct MockFramework {
    latency: Duration,
    fail_marker: Option<u8>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MockFramework {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            fail_marker: None,
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Simulated forward-pass latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inputs starting with this byte fail preprocess
    pub fn with_fail_marker(mut self, marker: u8) -> Self {
        self.fail_marker = Some(marker);
        self
    }

    /// Batch sizes seen by the forward pass, in order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for MockFramework {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelFramework for MockFramework {
    fn framework(&self) -> &str {
        "mock"
    }

    async fn preprocess(&self, input: &[u8]) -> Result<Vec<u8>> {
        if let Some(marker) = self.fail_marker {
            if input.first() == Some(&marker) {
                return Err(BackendError::Framework("bad input".to_string()));
            }
        }
        Ok(input.to_vec())
    }

    async fn forward(&self, inputs: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(inputs.len());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(inputs.to_vec())
    }

    async fn postprocess(&self, output: &[u8]) -> Result<Vec<u8>> {
        Ok(output.to_vec())
    }
}

/// Monotonic counter with rate sampling over the interval since the last
/// sample; feeds the stats reported to the scheduler each beacon
#[derive(Debug)]
pub struct RateCounter {
    count: AtomicU64,
    window: Mutex<(Instant, u64)>,
}

impl RateCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            count: AtomicU64::new(0),
            window: Mutex::new((now, 0)),
        }
    }

    /// Add `n` observations
    pub fn increase(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Total observations so far
    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Observations per second since the previous `rate` call; resets the
    /// sampling window
    pub fn rate(&self, now: Instant) -> f64 {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (last_at, last_count) = *window;
        let count = self.count.load(Ordering::Relaxed);
        let elapsed = now.saturating_duration_since(last_at).as_secs_f64();
        *window = (now, count);
        if elapsed <= 0.0 {
            return 0.0;
        }
        (count - last_count) as f64 / elapsed
    }
}

/// One loaded model instance: the session group it serves, the planned
/// batch bound, per-session input counters, and the framework adapter
pub struct ModelInstance {
    sessions: Vec<ModelSession>,
    instance: InstanceInfo,
    counters: HashMap<String, Arc<RateCounter>>,
    framework: Arc<dyn ModelFramework>,
}

impl ModelInstance {
    /// Build an instance, reusing prior counters where session ids match
    /// so rate windows survive model-table updates
    pub fn new(
        sessions: Vec<ModelSession>,
        instance: InstanceInfo,
        framework: Arc<dyn ModelFramework>,
        prior_counters: &HashMap<String, Arc<RateCounter>>,
    ) -> Self {
        let now = Instant::now();
        let counters = sessions
            .iter()
            .map(|sess| {
                let id = sess.session_id();
                let counter = prior_counters
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(RateCounter::new(now)));
                (id, counter)
            })
            .collect();
        Self {
            sessions,
            instance,
            counters,
            framework,
        }
    }

    /// Session id of the group head
    pub fn head_session_id(&self) -> String {
        self.sessions
            .first()
            .map(|s| s.session_id())
            .unwrap_or_default()
    }

    /// All session ids served by this instance
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.session_id()).collect()
    }

    /// Planner-chosen batch bound
    pub fn batch(&self) -> u32 {
        self.instance.batch.max(1)
    }

    /// Input counter for one member session
    pub fn counter(&self, model_sess_id: &str) -> Option<&Arc<RateCounter>> {
        self.counters.get(model_sess_id)
    }

    /// All per-session counters
    pub fn counters(&self) -> &HashMap<String, Arc<RateCounter>> {
        &self.counters
    }

    pub async fn preprocess(&self, input: &[u8]) -> Result<Vec<u8>> {
        self.framework.preprocess(input).await
    }

    pub async fn forward(&self, inputs: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        self.framework.forward(inputs).await
    }

    pub async fn postprocess(&self, output: &[u8]) -> Result<Vec<u8>> {
        self.framework.postprocess(output).await
    }
}
