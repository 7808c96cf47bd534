//! # nexus-scheduler
//!
//! The nexus control plane. One scheduler process owns the global view of
//! the fabric: which backends exist, which frontends subscribe to which
//! model sessions, and how each session's workload is spread across GPUs.
//!
//! The scheduler runs two periodic loops — a short beacon tick for
//! liveness and stats aggregation, and a longer epoch tick for global
//! rebalancing — plus a small synchronous RPC surface (`Register`,
//! `Unregister`, `LoadModel`, `UpdateBackendStats`, `KeepAlive`).
//!
//! All state mutations happen under a single mutex; outbound pushes to
//! nodes (model tables, routes) are queued as intents and dispatched only
//! after the lock is released.

pub mod backend_delegate;
pub mod config;
pub mod frontend_delegate;
pub mod scheduler;
pub mod server;
pub mod session_info;

pub use backend_delegate::BackendDelegate;
pub use config::{SchedulerConfig, WorkloadEntry};
pub use frontend_delegate::FrontendDelegate;
pub use scheduler::{Outbound, Scheduler};
pub use server::SchedulerServer;
pub use session_info::{SessionHandle, SessionInfo};
