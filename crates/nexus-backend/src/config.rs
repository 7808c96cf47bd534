//! Configuration for the backend process

use crate::{BackendError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default scheduler control port, appended when `sch_addr` has none
pub const SCHEDULER_DEFAULT_PORT: u16 = 10001;

/// Complete configuration for a backend node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Unique node id; randomly drawn when not configured
    pub node_id: u32,

    /// Port serving inference queries
    pub port: u16,

    /// Port serving control pushes from the scheduler
    pub rpc_port: u16,

    /// Scheduler address (port 10001 assumed if unspecified)
    pub sch_addr: String,

    /// GPU device index
    pub gpu: u32,

    /// GPU device name used to match model profiles
    pub gpu_device_name: String,

    /// Available GPU memory in megabytes
    pub gpu_memory_mb: u64,

    /// Number of worker threads
    pub num_workers: usize,

    /// Cores the workers should run on; empty means unpinned
    pub cores: Vec<usize>,

    /// How long the GPU executor waits to fill a batch, in milliseconds
    pub batch_window_ms: u64,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            node_id: rand::random(),
            port: 8001,
            rpc_port: 8002,
            sch_addr: "127.0.0.1".to_string(),
            gpu: 0,
            gpu_device_name: "mock-gpu".to_string(),
            gpu_memory_mb: 8192,
            num_workers: 4,
            cores: Vec::new(),
            batch_window_ms: 8,
            log_level: "info".to_string(),
        }
    }
}

impl BackendConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BackendError::Config(format!("Failed to read config file: {}", e)))?;
        let config: BackendConfig = serde_yaml::from_str(&content)
            .map_err(|e| BackendError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(BackendError::Config("need at least one worker".to_string()));
        }
        if self.port == self.rpc_port {
            return Err(BackendError::Config(
                "query and rpc ports must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Scheduler address with the default port filled in
    pub fn scheduler_addr(&self) -> String {
        if self.sch_addr.contains(':') {
            self.sch_addr.clone()
        } else {
            format!("{}:{}", self.sch_addr, SCHEDULER_DEFAULT_PORT)
        }
    }
}

/// Parse a core list like `0-3,5` into individual core ids.
///
/// Malformed input is fatal at startup.
pub fn parse_cores(spec: &str) -> Result<Vec<usize>> {
    let mut cores = Vec::new();
    if spec.is_empty() {
        return Ok(cores);
    }
    for segment in spec.split(',') {
        match segment.split_once('-') {
            None => {
                let core = segment
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| BackendError::Config(format!("bad core id: {:?}", segment)))?;
                cores.push(core);
            }
            Some((begin, end)) => {
                let begin = begin
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| BackendError::Config(format!("bad core range: {:?}", segment)))?;
                let end = end
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| BackendError::Config(format!("bad core range: {:?}", segment)))?;
                if end < begin {
                    return Err(BackendError::Config(format!(
                        "bad core range: {:?}",
                        segment
                    )));
                }
                cores.extend(begin..=end);
            }
        }
    }
    Ok(cores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cores() {
        assert_eq!(parse_cores("").unwrap(), Vec::<usize>::new());
        assert_eq!(parse_cores("3").unwrap(), vec![3]);
        assert_eq!(parse_cores("0-3,5").unwrap(), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_cores("0-2,4-5").unwrap(), vec![0, 1, 2, 4, 5]);
    }

    #[test]
    fn test_parse_cores_rejects_malformed() {
        assert!(parse_cores("a").is_err());
        assert!(parse_cores("1-").is_err());
        assert!(parse_cores("3-1").is_err());
        assert!(parse_cores("0-3,x").is_err());
    }

    #[test]
    fn test_scheduler_addr_default_port() {
        let mut config = BackendConfig::default();
        assert_eq!(config.scheduler_addr(), "127.0.0.1:10001");
        config.sch_addr = "10.0.0.5:2020".to_string();
        assert_eq!(config.scheduler_addr(), "10.0.0.5:2020");
    }

    #[test]
    fn test_validate() {
        assert!(BackendConfig::default().validate().is_ok());

        let mut config = BackendConfig::default();
        config.num_workers = 0;
        assert!(config.validate().is_err());

        let mut config = BackendConfig::default();
        config.rpc_port = config.port;
        assert!(config.validate().is_err());
    }
}
