//! # nexus-backend
//!
//! The backend node: accepts inference queries over the wire, routes them
//! through a preprocess -> GPU-execute -> postprocess pipeline with bounded
//! batching, and feeds per-session rate estimates back to the scheduler.
//!
//! A fixed pool of workers consumes a deadline-ordered task queue; a
//! single GPU executor batches ready tasks per model instance and invokes
//! the framework adapter. The real CUDA kernels live behind the
//! [`ModelFramework`] trait; a mock implementation stands in here.

pub mod config;
pub mod gpu_executor;
pub mod model_instance;
pub mod server;
pub mod task;
pub mod worker;

pub use config::BackendConfig;
pub use gpu_executor::GpuExecutor;
pub use model_instance::{MockFramework, ModelFramework, ModelInstance, RateCounter};
pub use server::BackendServer;
pub use task::{Task, TaskQueue, TaskStage, TaskTimer};
pub use worker::Worker;

/// Errors produced by the backend node
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Framework adapter failure
    #[error("Framework error: {0}")]
    Framework(String),

    /// Registration with the scheduler failed
    #[error("Registration error: {0}")]
    Registration(String),

    /// Wire protocol failure
    #[error("Protocol error: {0}")]
    Proto(#[from] nexus_proto::ProtoError),

    /// Core library failure
    #[error(transparent)]
    Core(#[from] nexus_core::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;
