//! Control RPC server and periodic loops
//!
//! One accept loop dispatches control requests into the state machine; one
//! timer task drives the beacon and epoch ticks off monotonic deadlines.
//! Handlers run under the state mutex but never touch the network; queued
//! [`Outbound`] intents are pushed after the lock is dropped.

use crate::{Outbound, Scheduler};
use nexus_proto::{read_frame, write_frame, ControlRequest, NodeMessage, RpcClient};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// The scheduler process: shared state plus its service loops
pub struct SchedulerServer {
    state: Arc<Mutex<Scheduler>>,
    port: u16,
}

impl SchedulerServer {
    pub fn new(scheduler: Scheduler, port: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(scheduler)),
            port,
        }
    }

    /// Shared handle to the scheduler state
    pub fn state(&self) -> Arc<Mutex<Scheduler>> {
        self.state.clone()
    }

    /// Bind the configured port and serve until Ctrl+C
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until Ctrl+C
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Scheduler control service listening");
        let timer = tokio::spawn(Self::timer_loop(self.state.clone()));
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let state = self.state.clone();
                            let peer_ip = peer.ip().to_string();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(state, stream, peer_ip).await
                                {
                                    debug!(error = %e, "Connection ended");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Accept failed"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }
        timer.abort();
        Ok(())
    }

    /// Serve one node connection: framed requests in, framed replies out
    async fn handle_connection(
        state: Arc<Mutex<Scheduler>>,
        mut stream: TcpStream,
        peer_ip: String,
    ) -> nexus_proto::Result<()> {
        loop {
            let request: ControlRequest = match read_frame(&mut stream).await {
                Ok(request) => request,
                // EOF or a broken frame ends the connection
                Err(_) => return Ok(()),
            };
            let (reply, outbound) = {
                let mut scheduler = lock_state(&state);
                scheduler.dispatch(request, peer_ip.clone(), Instant::now())
            };
            write_frame(&mut stream, &reply).await?;
            dispatch_outbound(outbound);
        }
    }

    /// Drive beacon and epoch ticks off monotonic deadlines
    async fn timer_loop(state: Arc<Mutex<Scheduler>>) {
        let (beacon, epoch, epoch_enabled) = {
            let scheduler = lock_state(&state);
            (
                Duration::from_secs(scheduler.beacon_interval_sec()),
                Duration::from_secs(scheduler.epoch_interval_sec()),
                scheduler.epoch_schedule_enabled(),
            )
        };
        let start = tokio::time::Instant::now();
        let mut next_beacon = start + beacon;
        let mut next_epoch = start + epoch;
        loop {
            let next = next_beacon.min(next_epoch);
            tokio::time::sleep_until(next).await;
            let mut outbound = Vec::new();
            let now = Instant::now();
            if next >= next_beacon {
                outbound.extend(lock_state(&state).beacon_check(now));
                next_beacon += beacon;
            }
            if next >= next_epoch {
                if epoch_enabled {
                    outbound.extend(lock_state(&state).epoch_schedule(now));
                }
                next_epoch += epoch;
            }
            dispatch_outbound(outbound);
        }
    }
}

fn lock_state(state: &Arc<Mutex<Scheduler>>) -> std::sync::MutexGuard<'_, Scheduler> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fire-and-forget delivery of planned control pushes
pub fn dispatch_outbound(outbound: Vec<Outbound>) {
    for message in outbound {
        tokio::spawn(async move {
            let (addr, node_message) = match message {
                Outbound::ModelTable { addr, update } => {
                    (addr, NodeMessage::UpdateModelTable(update))
                }
                Outbound::ModelRoutes { addr, updates } => {
                    (addr, NodeMessage::UpdateModelRoutes(updates))
                }
            };
            let client = RpcClient::new(addr);
            if let Err(e) = client.push(&node_message).await {
                warn!(addr = client.addr(), error = %e, "Failed to push control message");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use nexus_core::{CtrlStatus, ModelDatabase, NodeType};
    use nexus_proto::{ControlReply, KeepAliveRequest, RegisterRequest};

    const DB_YAML: &str = r#"
models:
  - framework: tensorflow
    model_name: resnet50
    version: 1
    memory_mb: 1024
    profiles:
      - gpu_device: mock-gpu
        forward_latency_us: [5000, 9000, 13000, 17000]
"#;

    async fn spawn_server() -> std::net::SocketAddr {
        let config = SchedulerConfig::default();
        let db = ModelDatabase::from_yaml(DB_YAML).unwrap();
        let scheduler = Scheduler::new(&config, db, Vec::new());
        let server = SchedulerServer::new(scheduler, 0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    #[tokio::test]
    async fn test_register_over_the_wire() {
        let addr = spawn_server().await;
        let client = RpcClient::new(addr.to_string());

        let reply = client
            .call(&ControlRequest::Register(RegisterRequest {
                node_id: 1,
                node_type: NodeType::Backend,
                server_port: 8001,
                rpc_port: 8002,
                gpu_device_name: Some("mock-gpu".to_string()),
                gpu_available_memory_mb: Some(8192),
            }))
            .await
            .unwrap();
        match reply {
            ControlReply::Register(r) => {
                assert_eq!(r.status, CtrlStatus::Ok);
                assert_eq!(r.beacon_interval_sec, 2);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_node_gets_error_status() {
        let addr = spawn_server().await;
        let client = RpcClient::new(addr.to_string());

        let reply = client
            .call(&ControlRequest::KeepAlive(KeepAliveRequest { node_id: 77 }))
            .await
            .unwrap();
        match reply {
            ControlReply::Rpc(r) => assert_eq!(r.status, CtrlStatus::ServerNotRegistered),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
