//! Backend server: registration, control pushes, query intake, stats

use crate::config::BackendConfig;
use crate::gpu_executor::GpuExecutor;
use crate::model_instance::{ModelFramework, ModelInstance, RateCounter};
use crate::task::{Task, TaskQueue};
use crate::worker::Worker;
use crate::{BackendError, Result};
use dashmap::DashMap;
use nexus_core::{CtrlStatus, ModelSession, NodeType};
use nexus_proto::{
    read_frame, write_frame, BackendStats, ControlReply, ControlRequest, ModelStats,
    ModelTableUpdate, NodeMessage, Query, QueryReply, RegisterRequest, RpcClient,
    UnregisterRequest,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queries whose session id does not parse still need a deadline
const DEFAULT_SLA_MS: u32 = 500;

/// One backend node: the pipeline plus its network surfaces
pub struct BackendServer {
    config: BackendConfig,
    framework: Arc<dyn ModelFramework>,
    instances: Arc<DashMap<String, Arc<ModelInstance>>>,
    task_queue: Arc<TaskQueue>,
    exec_tx: mpsc::UnboundedSender<Task>,
    exec_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    running: Arc<AtomicBool>,
}

impl BackendServer {
    pub fn new(config: BackendConfig, framework: Arc<dyn ModelFramework>) -> Self {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        Self {
            config,
            framework,
            instances: Arc::new(DashMap::new()),
            task_queue: Arc::new(TaskQueue::new()),
            exec_tx,
            exec_rx: Mutex::new(Some(exec_rx)),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Cooperative-shutdown flag shared with the pipeline
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Look up a loaded instance by session id
    pub fn model_instance(&self, model_sess_id: &str) -> Option<Arc<ModelInstance>> {
        self.instances
            .get(model_sess_id)
            .map(|entry| entry.value().clone())
    }

    /// Replace the model table with what the scheduler pushed. Counters
    /// carry over for sessions that stay loaded so rate windows survive.
    pub fn apply_model_table(&self, update: ModelTableUpdate) {
        apply_model_table(&self.instances, &self.framework, update);
    }

    /// Start the worker pool and the GPU executor. Idempotent: the second
    /// call returns no handles.
    pub fn spawn_pipeline(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let exec_rx = {
            let mut slot = self
                .exec_rx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        let Some(exec_rx) = exec_rx else {
            return handles;
        };
        for index in 0..self.config.num_workers {
            let worker = Worker::new(
                index,
                self.task_queue.clone(),
                self.instances.clone(),
                self.exec_tx.clone(),
                self.running.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }
        let executor = GpuExecutor::new(
            exec_rx,
            self.task_queue.clone(),
            Duration::from_millis(self.config.batch_window_ms),
            self.running.clone(),
        );
        handles.push(tokio::spawn(executor.run()));
        handles
    }

    /// Register with the scheduler; returns the beacon interval to report
    /// stats at
    pub async fn register(&self, client: &RpcClient) -> Result<u64> {
        let request = ControlRequest::Register(RegisterRequest {
            node_id: self.config.node_id,
            node_type: NodeType::Backend,
            server_port: self.config.port,
            rpc_port: self.config.rpc_port,
            gpu_device_name: Some(self.config.gpu_device_name.clone()),
            gpu_available_memory_mb: Some(self.config.gpu_memory_mb),
        });
        match client.call(&request).await? {
            ControlReply::Register(reply) if reply.status == CtrlStatus::Ok => {
                Ok(reply.beacon_interval_sec as u64)
            }
            ControlReply::Register(reply) => {
                Err(BackendError::Registration(reply.status.to_string()))
            }
            _ => Err(BackendError::Registration(
                "unexpected reply kind".to_string(),
            )),
        }
    }

    /// Accept inference queries from frontends
    pub async fn serve_queries(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Query service listening");
        loop {
            let (stream, _) = listener.accept().await?;
            let task_queue = self.task_queue.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_query_connection(task_queue, stream).await {
                    debug!(error = %e, "Query connection ended");
                }
            });
        }
    }

    /// Accept control pushes from the scheduler
    pub async fn serve_control(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Control service listening");
        loop {
            let (stream, _) = listener.accept().await?;
            let instances = self.instances.clone();
            let framework = self.framework.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_control_connection(instances, framework, stream).await {
                    debug!(error = %e, "Control connection ended");
                }
            });
        }
    }

    /// Full node lifecycle: register, run the pipeline and services until
    /// Ctrl+C, then unregister
    pub async fn run(&self) -> anyhow::Result<()> {
        self.config.validate()?;
        if !self.config.cores.is_empty() {
            info!(cores = ?self.config.cores, "Worker core set");
        }
        let query_listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let control_listener = TcpListener::bind(("0.0.0.0", self.config.rpc_port)).await?;

        let client = RpcClient::new(self.config.scheduler_addr());
        let beacon_sec = self.register(&client).await?;
        info!(
            node = self.config.node_id,
            scheduler = client.addr(),
            beacon = beacon_sec,
            "Registered with scheduler"
        );

        let _pipeline = self.spawn_pipeline();
        let stats = tokio::spawn(stats_loop(
            self.instances.clone(),
            self.task_queue.clone(),
            client.clone(),
            self.config.node_id,
            Duration::from_secs(beacon_sec.max(1)),
            self.running.clone(),
        ));

        tokio::select! {
            result = self.serve_queries(query_listener) => result?,
            result = self.serve_control(control_listener) => result?,
            _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        }

        self.running.store(false, Ordering::Relaxed);
        stats.abort();
        let _ = client
            .call(&ControlRequest::Unregister(UnregisterRequest {
                node_id: self.config.node_id,
                node_type: NodeType::Backend,
            }))
            .await;
        Ok(())
    }
}

/// Read queries off one frontend connection and stream replies back
async fn handle_query_connection(
    task_queue: Arc<TaskQueue>,
    stream: TcpStream,
) -> nexus_proto::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<QueryReply>();
    let writer_task = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if write_frame(&mut writer, &reply).await.is_err() {
                break;
            }
        }
    });
    loop {
        let query: Query = match read_frame(&mut reader).await {
            Ok(query) => query,
            Err(_) => break,
        };
        let sla_ms = ModelSession::parse(&query.model_session_id)
            .map(|sess| sess.latency_sla_ms)
            .unwrap_or(DEFAULT_SLA_MS);
        task_queue.push(Task::new(query, sla_ms, reply_tx.clone()));
    }
    drop(reply_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Apply scheduler pushes arriving on one control connection
async fn handle_control_connection(
    instances: Arc<DashMap<String, Arc<ModelInstance>>>,
    framework: Arc<dyn ModelFramework>,
    mut stream: TcpStream,
) -> nexus_proto::Result<()> {
    loop {
        let message: NodeMessage = match read_frame(&mut stream).await {
            Ok(message) => message,
            Err(_) => return Ok(()),
        };
        match message {
            NodeMessage::UpdateModelTable(update) => {
                apply_model_table(&instances, &framework, update);
            }
            NodeMessage::UpdateModelRoutes(_) => {
                warn!("Backend received a route update meant for a frontend");
            }
        }
    }
}

fn apply_model_table(
    instances: &DashMap<String, Arc<ModelInstance>>,
    framework: &Arc<dyn ModelFramework>,
    update: ModelTableUpdate,
) {
    let mut prior: HashMap<String, Arc<RateCounter>> = HashMap::new();
    for entry in instances.iter() {
        for (id, counter) in entry.value().counters() {
            prior.insert(id.clone(), counter.clone());
        }
    }
    instances.clear();
    let mut loaded = 0usize;
    for instance_config in update.model_instances {
        let instance = Arc::new(ModelInstance::new(
            instance_config.sessions,
            instance_config.instance,
            framework.clone(),
            &prior,
        ));
        for model_sess_id in instance.session_ids() {
            instances.insert(model_sess_id, instance.clone());
        }
        loaded += 1;
    }
    info!(instances = loaded, "Applied model table update");
}

/// Report per-session rates to the scheduler every beacon; this is also
/// the backend's liveness signal
async fn stats_loop(
    instances: Arc<DashMap<String, Arc<ModelInstance>>>,
    task_queue: Arc<TaskQueue>,
    client: RpcClient,
    node_id: u32,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let now = Instant::now();
        let queue_length = task_queue.len() as u32;
        let mut model_stats = Vec::new();
        for entry in instances.iter() {
            let model_sess_id = entry.key().clone();
            let rps = entry
                .value()
                .counter(&model_sess_id)
                .map(|counter| counter.rate(now))
                .unwrap_or(0.0);
            model_stats.push(ModelStats {
                model_session_id: model_sess_id,
                rps,
                drop_rate: 0.0,
                queue_length,
            });
        }
        let stats = BackendStats {
            node_id,
            model_stats,
        };
        if let Err(e) = client
            .call(&ControlRequest::UpdateBackendStats(stats))
            .await
        {
            warn!(error = %e, "Failed to report backend stats");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_instance::MockFramework;
    use nexus_core::InstanceInfo;
    use nexus_proto::ModelInstanceConfig;

    fn table_update(sessions: Vec<ModelSession>, batch: u32) -> ModelTableUpdate {
        ModelTableUpdate {
            model_instances: vec![ModelInstanceConfig {
                sessions,
                instance: InstanceInfo {
                    batch,
                    max_batch: batch,
                    throughput: 100.0,
                    memory_mb: 256,
                    occupancy: 0.5,
                },
            }],
            session_backups: Vec::new(),
        }
    }

    #[test]
    fn test_apply_model_table_maps_group_to_one_instance() {
        let server = BackendServer::new(
            BackendConfig::default(),
            Arc::new(MockFramework::new()),
        );
        let head = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let peer = ModelSession::new("tensorflow", "resnet152", 1, 100);
        server.apply_model_table(table_update(vec![head.clone(), peer.clone()], 4));

        let a = server.model_instance(&head.session_id()).unwrap();
        let b = server.model_instance(&peer.session_id()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.batch(), 4);
    }

    #[test]
    fn test_apply_model_table_preserves_counters() {
        let server = BackendServer::new(
            BackendConfig::default(),
            Arc::new(MockFramework::new()),
        );
        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let id = sess.session_id();
        server.apply_model_table(table_update(vec![sess.clone()], 4));
        server
            .model_instance(&id)
            .unwrap()
            .counter(&id)
            .unwrap()
            .increase(5);

        server.apply_model_table(table_update(vec![sess], 8));
        let instance = server.model_instance(&id).unwrap();
        assert_eq!(instance.counter(&id).unwrap().total(), 5);
        assert_eq!(instance.batch(), 8);
    }

    #[tokio::test]
    async fn test_query_over_the_wire() {
        let mut config = BackendConfig::default();
        config.num_workers = 2;
        config.batch_window_ms = 5;
        let server = Arc::new(BackendServer::new(config, Arc::new(MockFramework::new())));
        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let session_id = sess.session_id();
        server.apply_model_table(table_update(vec![sess], 4));
        let _handles = server.spawn_pipeline();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve_queries(listener).await });
        }

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            &Query {
                query_id: 99,
                model_session_id: session_id.clone(),
                window_size: 1,
                input: vec![9, 9, 9],
            },
        )
        .await
        .unwrap();
        let reply: QueryReply = read_frame(&mut stream).await.unwrap();
        assert_eq!(reply.query_id, 99);
        assert_eq!(reply.model_session_id, session_id);
        assert_eq!(reply.status, CtrlStatus::Ok);
        assert_eq!(reply.output, vec![9, 9, 9]);

        server.running().store(false, Ordering::Relaxed);
    }
}
