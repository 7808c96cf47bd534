//! # nexus-proto
//!
//! Message definitions and wire framing for the nexus control and query
//! planes.
//!
//! Messages are plain serde structures; frames on the wire are a 4-byte
//! big-endian length followed by the bincode encoding of the message. The
//! exact serialization is deliberately an implementation detail: callers
//! only depend on message kinds and fields.

pub mod codec;
pub mod message;

pub use codec::{read_frame, write_frame, RpcClient, MAX_FRAME_SIZE};
pub use message::{
    BackendRate, BackendStats, ControlReply, ControlRequest, KeepAliveRequest, LoadModelReply,
    LoadModelRequest, ModelInstanceConfig, ModelRoute, ModelRouteUpdates, ModelStats,
    ModelTableUpdate, NodeMessage, Query, QueryReply, RegisterReply, RegisterRequest, RpcReply,
    SessionBackups, UnregisterRequest,
};

/// Errors produced by the proto layer
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Frame exceeded [`MAX_FRAME_SIZE`]
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
