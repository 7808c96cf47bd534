//! Worker pool: preprocess and postprocess stages

use crate::model_instance::ModelInstance;
use crate::task::{Task, TaskQueue, TaskStage};
use dashmap::DashMap;
use nexus_core::CtrlStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Workers re-check their running flag this often while idle
const POP_TIMEOUT: Duration = Duration::from_millis(50);

/// One worker: pops tasks off the shared queue and runs whichever CPU
/// stage the task is in
pub struct Worker {
    index: usize,
    task_queue: Arc<TaskQueue>,
    instances: Arc<DashMap<String, Arc<ModelInstance>>>,
    exec_tx: mpsc::UnboundedSender<Task>,
    running: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        index: usize,
        task_queue: Arc<TaskQueue>,
        instances: Arc<DashMap<String, Arc<ModelInstance>>>,
        exec_tx: mpsc::UnboundedSender<Task>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            task_queue,
            instances,
            exec_tx,
            running,
        }
    }

    pub async fn run(self) {
        info!(worker = self.index, "Worker started");
        while self.running.load(Ordering::Relaxed) {
            let Some(task) = self.task_queue.pop(POP_TIMEOUT).await else {
                continue;
            };
            self.process(task).await;
        }
        info!(worker = self.index, "Worker stopped");
    }

    async fn process(&self, mut task: Task) {
        match task.stage {
            TaskStage::Preprocess => {
                let Some(instance) = self
                    .instances
                    .get(&task.query.model_session_id)
                    .map(|entry| entry.value().clone())
                else {
                    warn!(
                        session = %task.query.model_session_id,
                        "Model session is not loaded"
                    );
                    task.status = CtrlStatus::ModelSessionNotLoaded;
                    task.send_reply();
                    return;
                };
                if let Some(counter) = instance.counter(&task.query.model_session_id) {
                    counter.increase(task.query.window_size.max(1) as u64);
                }
                match instance.preprocess(&task.query.input).await {
                    Ok(tensor) => {
                        task.tensor = Some(tensor);
                        task.instance = Some(instance);
                        if let Err(send_error) = self.exec_tx.send(task) {
                            error!("GPU executor is gone");
                            let mut task = send_error.0;
                            task.status = CtrlStatus::ExecutionError;
                            task.send_reply();
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Preprocess failed");
                        task.status = CtrlStatus::InputError;
                        task.send_reply();
                    }
                }
            }
            TaskStage::Postprocess => {
                if task.status != CtrlStatus::Ok {
                    task.send_reply();
                    return;
                }
                let Some(instance) = task.instance.clone() else {
                    task.status = CtrlStatus::ExecutionError;
                    task.send_reply();
                    return;
                };
                match instance.postprocess(&task.output).await {
                    Ok(output) => {
                        task.output = output;
                        task.send_reply();
                    }
                    Err(e) => {
                        warn!(error = %e, "Postprocess failed");
                        task.status = CtrlStatus::ExecutionError;
                        task.send_reply();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_instance::{MockFramework, ModelFramework};
    use nexus_core::{InstanceInfo, ModelSession};
    use nexus_proto::Query;
    use std::collections::HashMap;

    fn test_instance(framework: Arc<dyn ModelFramework>) -> (String, Arc<ModelInstance>) {
        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let id = sess.session_id();
        let instance = Arc::new(ModelInstance::new(
            vec![sess],
            InstanceInfo {
                batch: 4,
                max_batch: 4,
                throughput: 100.0,
                memory_mb: 256,
                occupancy: 0.5,
            },
            framework,
            &HashMap::new(),
        ));
        (id, instance)
    }

    fn worker_under_test(
        instances: Arc<DashMap<String, Arc<ModelInstance>>>,
    ) -> (Worker, mpsc::UnboundedReceiver<Task>) {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(
            0,
            Arc::new(TaskQueue::new()),
            instances,
            exec_tx,
            Arc::new(AtomicBool::new(true)),
        );
        (worker, exec_rx)
    }

    fn query_task(
        session_id: &str,
        input: Vec<u8>,
    ) -> (Task, mpsc::UnboundedReceiver<nexus_proto::QueryReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = Task::new(
            Query {
                query_id: 1,
                model_session_id: session_id.to_string(),
                window_size: 1,
                input,
            },
            100,
            tx,
        );
        (task, rx)
    }

    #[tokio::test]
    async fn test_unknown_session_gets_not_loaded_reply() {
        let instances = Arc::new(DashMap::new());
        let (worker, _exec_rx) = worker_under_test(instances);
        let (task, mut reply_rx) = query_task("tensorflow:unknown:1:100", vec![1]);

        worker.process(task).await;
        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.status, CtrlStatus::ModelSessionNotLoaded);
        assert_eq!(reply.query_id, 1);
    }

    #[tokio::test]
    async fn test_preprocess_forwards_to_executor_and_counts() {
        let framework: Arc<dyn ModelFramework> = Arc::new(MockFramework::new());
        let (id, instance) = test_instance(framework);
        let instances = Arc::new(DashMap::new());
        instances.insert(id.clone(), instance.clone());
        let (worker, mut exec_rx) = worker_under_test(instances);
        let (task, _reply_rx) = query_task(&id, vec![1, 2]);

        worker.process(task).await;
        let task = exec_rx.recv().await.unwrap();
        assert_eq!(task.tensor.as_deref(), Some(&[1u8, 2u8][..]));
        assert_eq!(instance.counter(&id).unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_preprocess_failure_replies_with_status() {
        let framework: Arc<dyn ModelFramework> =
            Arc::new(MockFramework::new().with_fail_marker(0xFF));
        let (id, instance) = test_instance(framework);
        let instances = Arc::new(DashMap::new());
        instances.insert(id.clone(), instance);
        let (worker, mut exec_rx) = worker_under_test(instances);
        let (task, mut reply_rx) = query_task(&id, vec![0xFF]);

        worker.process(task).await;
        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.status, CtrlStatus::InputError);
        assert!(exec_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_postprocess_passes_failed_status_through() {
        let framework: Arc<dyn ModelFramework> = Arc::new(MockFramework::new());
        let (id, instance) = test_instance(framework);
        let instances = Arc::new(DashMap::new());
        instances.insert(id.clone(), instance.clone());
        let (worker, _exec_rx) = worker_under_test(instances);

        let (mut task, mut reply_rx) = query_task(&id, vec![1]);
        task.stage = TaskStage::Postprocess;
        task.status = CtrlStatus::ExecutionError;
        task.instance = Some(instance);
        worker.process(task).await;
        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.status, CtrlStatus::ExecutionError);
    }
}
