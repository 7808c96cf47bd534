//! Control and query plane message types

use nexus_core::{BackendInfo, CtrlStatus, InstanceInfo, ModelSession, NodeType};
use serde::{Deserialize, Serialize};

/// Request to register a node with the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: u32,
    pub node_type: NodeType,
    pub server_port: u16,
    pub rpc_port: u16,
    /// GPU device name; backends only
    pub gpu_device_name: Option<String>,
    /// Available GPU memory in megabytes; backends only
    pub gpu_available_memory_mb: Option<u64>,
}

/// Reply to [`RegisterRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub status: CtrlStatus,
    pub beacon_interval_sec: u32,
}

/// Request to remove a node from the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub node_id: u32,
    pub node_type: NodeType,
}

/// Generic status-only reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub status: CtrlStatus,
}

/// Frontend request to place a model session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub node_id: u32,
    pub model_session: ModelSession,
    /// Estimated request rate in req/s; zero means discovery-only
    pub estimate_workload: f64,
}

/// Reply to [`LoadModelRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelReply {
    pub status: CtrlStatus,
    pub model_route: Option<ModelRoute>,
}

/// Per-session statistics sample reported by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub model_session_id: String,
    /// Observed request rate over the reporting window, req/s
    pub rps: f64,
    /// Fraction of requests dropped over the window
    pub drop_rate: f64,
    /// Queue length at sampling time
    pub queue_length: u32,
}

/// Backend beacon payload: stats for every loaded session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub node_id: u32,
    pub model_stats: Vec<ModelStats>,
}

/// Frontend liveness ping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub node_id: u32,
}

/// One backend's share of a model route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRate {
    pub info: BackendInfo,
    pub throughput: f64,
}

/// Routing entry for one model session: which backends serve it and at
/// what rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRoute {
    pub model_session_id: String,
    pub backends: Vec<BackendRate>,
}

/// Batch of route updates pushed to one frontend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRouteUpdates {
    pub routes: Vec<ModelRoute>,
}

/// One model instance a backend should run: the session group sharing the
/// instance (head first) and the planned placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstanceConfig {
    pub sessions: Vec<ModelSession>,
    pub instance: InstanceInfo,
}

/// Backup backends for one session, pushed alongside the model table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBackups {
    pub model_session_id: String,
    pub backups: Vec<BackendInfo>,
}

/// Full model table pushed to a backend after placement changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTableUpdate {
    pub model_instances: Vec<ModelInstanceConfig>,
    pub session_backups: Vec<SessionBackups>,
}

/// Inference query forwarded from a frontend to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub query_id: u64,
    pub model_session_id: String,
    /// Sliding-window size for streaming inputs; counted as at least 1
    pub window_size: u32,
    pub input: Vec<u8>,
}

/// Reply to a [`Query`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReply {
    pub query_id: u64,
    pub model_session_id: String,
    pub status: CtrlStatus,
    /// Total latency from arrival to reply, microseconds
    pub latency_us: u64,
    /// Time spent before GPU dispatch, microseconds
    pub queuing_us: u64,
    pub output: Vec<u8>,
}

/// Requests a node sends to the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlRequest {
    Register(RegisterRequest),
    Unregister(UnregisterRequest),
    LoadModel(LoadModelRequest),
    UpdateBackendStats(BackendStats),
    KeepAlive(KeepAliveRequest),
}

/// Replies the scheduler sends back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlReply {
    Register(RegisterReply),
    LoadModel(LoadModelReply),
    Rpc(RpcReply),
}

/// Fire-and-forget messages the scheduler pushes to nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// New model table for a backend
    UpdateModelTable(ModelTableUpdate),
    /// New routes for a frontend
    UpdateModelRoutes(ModelRouteUpdates),
}
