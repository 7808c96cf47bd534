//! GPU executor: single-threaded batching and dispatch
//!
//! Preprocessed tasks flow in over a channel. The executor groups them per
//! model instance and fires a batch when it reaches the planner-chosen
//! size or when the batch window expires, whichever comes first. Finished
//! tasks go back onto the worker queue for postprocess.

use crate::model_instance::ModelInstance;
use crate::task::{Task, TaskQueue, TaskStage};
use nexus_core::CtrlStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Tasks waiting to fill one instance's batch
struct PendingBatch {
    tasks: Vec<Task>,
    window_start: tokio::time::Instant,
}

/// The single GPU executor task
pub struct GpuExecutor {
    rx: mpsc::UnboundedReceiver<Task>,
    task_queue: Arc<TaskQueue>,
    batch_window: Duration,
    running: Arc<AtomicBool>,
}

impl GpuExecutor {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Task>,
        task_queue: Arc<TaskQueue>,
        batch_window: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            task_queue,
            batch_window,
            running,
        }
    }

    pub async fn run(mut self) {
        info!("GPU executor started");
        let poll = self.batch_window.max(Duration::from_millis(1));
        let mut pending: HashMap<String, PendingBatch> = HashMap::new();
        while self.running.load(Ordering::Relaxed) {
            match tokio::time::timeout(poll, self.rx.recv()).await {
                Ok(Some(task)) => enqueue(&mut pending, task),
                Ok(None) => break,
                Err(_) => {}
            }
            // Pull in everything already waiting before deciding
            while let Ok(task) = self.rx.try_recv() {
                enqueue(&mut pending, task);
            }

            let now = tokio::time::Instant::now();
            let ready: Vec<String> = pending
                .iter()
                .filter(|(_, batch)| {
                    let limit = batch
                        .tasks
                        .first()
                        .and_then(|t| t.instance.as_ref())
                        .map(|i| i.batch() as usize)
                        .unwrap_or(1);
                    batch.tasks.len() >= limit || now >= batch.window_start + self.batch_window
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in ready {
                if let Some(batch) = pending.remove(&key) {
                    self.execute(batch.tasks).await;
                }
            }
        }
        // Flush whatever is still pending so no task is silently dropped
        for (_, batch) in pending.drain() {
            self.execute(batch.tasks).await;
        }
        info!("GPU executor stopped");
    }

    async fn execute(&self, mut tasks: Vec<Task>) {
        let Some(instance) = tasks.first().and_then(|t| t.instance.clone()) else {
            for mut task in tasks {
                task.status = CtrlStatus::ExecutionError;
                task.send_reply();
            }
            return;
        };
        let limit = instance.batch() as usize;
        while !tasks.is_empty() {
            let take = tasks.len().min(limit);
            let chunk: Vec<Task> = tasks.drain(..take).collect();
            self.forward_chunk(&instance, chunk).await;
        }
    }

    async fn forward_chunk(&self, instance: &Arc<ModelInstance>, mut chunk: Vec<Task>) {
        for task in &mut chunk {
            task.timer.record("exec");
        }
        let inputs: Vec<Vec<u8>> = chunk
            .iter()
            .map(|task| task.tensor.clone().unwrap_or_default())
            .collect();
        match instance.forward(&inputs).await {
            Ok(outputs) => {
                for (task, output) in chunk.iter_mut().zip(outputs) {
                    task.output = output;
                }
            }
            Err(e) => {
                warn!(error = %e, "Forward pass failed");
                for task in &mut chunk {
                    task.status = CtrlStatus::ExecutionError;
                }
            }
        }
        for mut task in chunk {
            task.stage = TaskStage::Postprocess;
            self.task_queue.push(task);
        }
    }
}

/// Group an incoming task under its instance's head session
fn enqueue(pending: &mut HashMap<String, PendingBatch>, task: Task) {
    let key = task
        .instance
        .as_ref()
        .map(|i| i.head_session_id())
        .unwrap_or_default();
    pending
        .entry(key)
        .or_insert_with(|| PendingBatch {
            tasks: Vec::new(),
            window_start: tokio::time::Instant::now(),
        })
        .tasks
        .push(task);
}
