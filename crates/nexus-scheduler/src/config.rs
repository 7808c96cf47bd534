//! Configuration for the scheduler process

use nexus_core::{Error, ModelSession, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete configuration for the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Port the control RPC service listens on
    pub port: u16,

    /// Beacon (liveness/stats) interval in seconds
    pub beacon_interval_sec: u64,

    /// Epoch (rebalancing) interval in seconds
    pub epoch_interval_sec: u64,

    /// Enable epoch scheduling
    pub epoch_schedule: bool,

    /// Enable prefix batching
    pub prefix_batch: bool,

    /// Root directory of the model database
    pub model_db_root: PathBuf,

    /// Optional static workload file: a YAML list of per-backend lists of
    /// model session entries
    pub workload_file: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            port: 10001,
            beacon_interval_sec: 2,
            epoch_interval_sec: 10,
            epoch_schedule: true,
            prefix_batch: true,
            model_db_root: PathBuf::from("model-db"),
            workload_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;
        let config: SchedulerConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.beacon_interval_sec == 0 {
            return Err(Error::config("beacon interval must be positive"));
        }
        if self.epoch_interval_sec < self.beacon_interval_sec {
            return Err(Error::config(
                "epoch interval must be at least the beacon interval",
            ));
        }
        Ok(())
    }

    /// Load the static workload file, if configured
    pub fn load_workloads(&self) -> Result<Vec<Vec<WorkloadEntry>>> {
        let Some(path) = &self.workload_file else {
            return Ok(Vec::new());
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read workload file: {}", e)))?;
        let workloads: Vec<Vec<WorkloadEntry>> = serde_yaml::from_str(&content)
            .map_err(|e| Error::config(format!("Failed to parse workload file: {}", e)))?;
        Ok(workloads)
    }
}

/// One model session inside a static workload slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadEntry {
    pub framework: String,
    pub model_name: String,
    pub version: u32,
    pub latency_sla_ms: u32,
    #[serde(default)]
    pub image_height: u32,
    #[serde(default)]
    pub image_width: u32,
    /// Standby entry: the backend backs this session up instead of
    /// serving it as a primary
    #[serde(default)]
    pub backup: bool,
}

impl WorkloadEntry {
    /// The model session this entry describes
    pub fn session(&self) -> ModelSession {
        ModelSession::new(
            &self.framework,
            &self.model_name,
            self.version,
            self.latency_sla_ms,
        )
        .with_dims(self.image_height, self.image_width)
    }
}
