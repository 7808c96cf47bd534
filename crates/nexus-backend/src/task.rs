//! Tasks and the deadline-ordered task queue
//!
//! A task is owned exclusively by whichever component currently holds it:
//! a worker during preprocess/postprocess, the GPU executor during the
//! forward pass. Handoff is move-only.

use crate::model_instance::ModelInstance;
use nexus_core::CtrlStatus;
use nexus_proto::{Query, QueryReply};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Stage of the task state machine; GPU execution is implicit between the
/// two (the executor holds the task)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStage {
    Preprocess,
    Postprocess,
}

/// Wall-clock marks recorded along a task's lifecycle
#[derive(Debug, Clone, Default)]
pub struct TaskTimer {
    marks: Vec<(&'static str, Instant)>,
}

impl TaskTimer {
    /// Record a named mark at the current instant
    pub fn record(&mut self, name: &'static str) {
        self.marks.push((name, Instant::now()));
    }

    fn mark(&self, name: &str) -> Option<Instant> {
        self.marks
            .iter()
            .find(|(mark, _)| *mark == name)
            .map(|(_, at)| *at)
    }

    /// Microseconds between two named marks, if both exist
    pub fn latency_us(&self, from: &str, to: &str) -> Option<u64> {
        let from = self.mark(from)?;
        let to = self.mark(to)?;
        Some(to.saturating_duration_since(from).as_micros() as u64)
    }
}

/// One in-flight query
pub struct Task {
    pub query: Query,
    pub stage: TaskStage,
    pub status: CtrlStatus,
    pub arrival: Instant,
    /// Latency-SLA deadline; earlier deadlines run first
    pub deadline: Instant,
    pub timer: TaskTimer,
    /// Resolved in preprocess
    pub instance: Option<Arc<ModelInstance>>,
    /// Prepared input tensor, produced by preprocess
    pub tensor: Option<Vec<u8>>,
    /// Output blob, produced by the forward pass / postprocess
    pub output: Vec<u8>,
    /// Channel the final reply is sent on
    pub reply_tx: mpsc::UnboundedSender<QueryReply>,
}

impl Task {
    /// Create a fresh task for a query arriving now, due `sla_ms` later
    pub fn new(query: Query, sla_ms: u32, reply_tx: mpsc::UnboundedSender<QueryReply>) -> Self {
        let arrival = Instant::now();
        let mut timer = TaskTimer::default();
        timer.record("begin");
        Self {
            query,
            stage: TaskStage::Preprocess,
            status: CtrlStatus::Ok,
            arrival,
            deadline: arrival + Duration::from_millis(sla_ms as u64),
            timer,
            instance: None,
            tensor: None,
            output: Vec::new(),
            reply_tx,
        }
    }

    /// Build and send the reply for this task; records the `end` mark
    pub fn send_reply(mut self) {
        self.timer.record("end");
        let latency_us = self.timer.latency_us("begin", "end").unwrap_or(0);
        let queuing_us = self.timer.latency_us("begin", "exec").unwrap_or(latency_us);
        let reply = QueryReply {
            query_id: self.query.query_id,
            model_session_id: self.query.model_session_id.clone(),
            status: self.status,
            latency_us,
            queuing_us,
            output: self.output,
        };
        // The peer may already be gone; nothing to do then
        let _ = self.reply_tx.send(reply);
    }
}

/// Heap entry ordering: earliest deadline first, then earliest arrival
struct QueuedTask(Task);

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.arrival == other.0.arrival
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins
        other
            .0
            .deadline
            .cmp(&self.0.deadline)
            .then_with(|| other.0.arrival.cmp(&self.0.arrival))
    }
}

/// MPMC priority queue with a blocking, timed pop
pub struct TaskQueue {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<QueuedTask>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a task and wake one consumer
    pub fn push(&self, task: Task) {
        self.lock().push(QueuedTask(task));
        self.notify.notify_one();
    }

    /// Dequeue the highest-priority task, waiting up to `timeout`.
    /// Returns `None` on timeout so consumers can re-check their running
    /// flag.
    pub async fn pop(&self, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.lock().pop() {
                return Some(task.0);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.lock().pop().map(|task| task.0);
            }
        }
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
