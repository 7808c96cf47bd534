//! # nexus-core
//!
//! Core types and utilities shared by the nexus scheduler and backend nodes.
//!
//! This crate provides the foundational pieces the rest of the fabric is
//! built from:
//!
//! - Model session identifiers and their canonical string encoding
//! - Node, status, and placement types exchanged over the control plane
//! - The read-only model database (profiles, memory footprints, prefix
//!   sharing groups) loaded from YAML files
//! - Error handling types shared across all nexus components

pub mod error;
pub mod model_db;
pub mod session;
pub mod types;

pub use error::{Error, Result};
pub use model_db::{GpuProfile, ModelDatabase, ModelInfo};
pub use session::ModelSession;
pub use types::{BackendInfo, CtrlStatus, InstanceInfo, NodeType};
