//! Core type definitions shared across the nexus control plane

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a node registering with the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Accepts user queries and forwards them to backends
    Frontend,
    /// Runs model inference on one GPU
    Backend,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Frontend => write!(f, "frontend"),
            NodeType::Backend => write!(f, "backend"),
        }
    }
}

/// Control-plane status codes carried in RPC replies.
///
/// Handlers never fail with a transport error on invalid input; they reply
/// with one of these codes instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlStatus {
    /// Success
    Ok,
    /// Caller node id is not registered with the scheduler
    ServerNotRegistered,
    /// Frontend node id already registered
    FrontendNodeIdConflict,
    /// Backend node id already registered
    BackendNodeIdConflict,
    /// Model id is unknown to the model database
    ModelNotFound,
    /// Query named a session the backend has not loaded
    ModelSessionNotLoaded,
    /// Placement search could not cover the requested workload
    NotEnoughBackends,
    /// Query input could not be preprocessed
    InputError,
    /// Forward pass or postprocess failed
    ExecutionError,
}

impl CtrlStatus {
    /// Whether this status indicates success
    pub fn is_ok(&self) -> bool {
        matches!(self, CtrlStatus::Ok)
    }
}

impl fmt::Display for CtrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CtrlStatus::Ok => "CTRL_OK",
            CtrlStatus::ServerNotRegistered => "CTRL_SERVER_NOT_REGISTERED",
            CtrlStatus::FrontendNodeIdConflict => "CTRL_FRONTEND_NODE_ID_CONFLICT",
            CtrlStatus::BackendNodeIdConflict => "CTRL_BACKEND_NODE_ID_CONFLICT",
            CtrlStatus::ModelNotFound => "MODEL_NOT_FOUND",
            CtrlStatus::ModelSessionNotLoaded => "MODEL_SESSION_NOT_LOADED",
            CtrlStatus::NotEnoughBackends => "NOT_ENOUGH_BACKENDS",
            CtrlStatus::InputError => "INPUT_ERROR",
            CtrlStatus::ExecutionError => "EXECUTION_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// Addressing information for one backend node, as published in routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Unique node id
    pub node_id: u32,

    /// IP address of the node
    pub ip: String,

    /// Port serving inference queries
    pub server_port: u16,

    /// Port serving control RPCs
    pub rpc_port: u16,
}

impl BackendInfo {
    /// Address frontends send queries to
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.ip, self.server_port)
    }

    /// Address the scheduler sends control messages to
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.ip, self.rpc_port)
    }
}

impl fmt::Display for BackendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}@{}", self.node_id, self.server_addr())
    }
}

/// Planned placement of one model session on one backend.
///
/// Produced by the capacity planner; shipped to the backend in model table
/// updates so the GPU executor knows its batch bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Batch size chosen under the latency SLA
    pub batch: u32,

    /// Largest batch the profile admits under the SLA
    pub max_batch: u32,

    /// Achievable request rate at this batch (req/s), prorated to the
    /// target rate when the target is below the profile peak
    pub throughput: f64,

    /// GPU memory footprint in megabytes
    pub memory_mb: u64,

    /// Throughput divided by the peak throughput at `max_batch`
    pub occupancy: f64,
}
