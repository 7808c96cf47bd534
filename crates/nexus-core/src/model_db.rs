//! Read-only model metadata database
//!
//! The database is a directory of YAML files keyed by model id. It answers
//! two questions for the scheduler: what does a model cost to run (profile
//! curves, memory) and which models can share a prefix. It is constructed
//! once at startup from a root path and passed explicitly to whoever needs
//! it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// File name of the model index inside the database root
const DB_FILE: &str = "db.yml";

/// Measured profile of one model on one GPU device.
///
/// `forward_latency_us[b - 1]` is the forward-pass latency of batch `b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProfile {
    /// GPU device name this profile was measured on
    pub gpu_device: String,

    /// Forward latency curve in microseconds, indexed by batch size
    pub forward_latency_us: Vec<f64>,

    /// Fixed preprocess cost per query in microseconds
    #[serde(default)]
    pub preprocess_us: f64,

    /// Fixed postprocess cost per query in microseconds
    #[serde(default)]
    pub postprocess_us: f64,
}

impl GpuProfile {
    /// Largest batch size the curve covers
    pub fn max_profiled_batch(&self) -> u32 {
        self.forward_latency_us.len() as u32
    }

    /// Forward latency for a batch, if profiled
    pub fn forward_latency(&self, batch: u32) -> Option<f64> {
        if batch == 0 {
            return None;
        }
        self.forward_latency_us.get(batch as usize - 1).copied()
    }

    /// Peak request rate at a batch: `batch / latency`
    pub fn throughput(&self, batch: u32) -> Option<f64> {
        let latency = self.forward_latency(batch)?;
        if latency <= 0.0 {
            return None;
        }
        Some(batch as f64 * 1e6 / latency)
    }

    /// Largest batch whose duty cycle fits the latency SLA:
    /// `batch * forward_latency(batch) <= sla`
    pub fn max_batch_under_sla(&self, latency_sla_ms: u32) -> Option<u32> {
        let budget_us = latency_sla_ms as f64 * 1000.0;
        let mut best = None;
        for batch in 1..=self.max_profiled_batch() {
            let latency = self.forward_latency(batch)?;
            if batch as f64 * latency <= budget_us {
                best = Some(batch);
            }
        }
        best
    }

    /// Peak throughput achievable under the latency SLA
    pub fn peak_throughput_under_sla(&self, latency_sla_ms: u32) -> Option<f64> {
        let batch = self.max_batch_under_sla(latency_sla_ms)?;
        self.throughput(batch)
    }
}

/// Metadata for one model in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Framework the model runs on
    pub framework: String,

    /// Model name
    pub model_name: String,

    /// Model version
    pub version: u32,

    /// Whether the input can be resized; resizable models carry default
    /// dimensions that sessions with zero dims acquire
    #[serde(default)]
    pub resizable: bool,

    /// Default input height for resizable models
    #[serde(default)]
    pub image_height: u32,

    /// Default input width for resizable models
    #[serde(default)]
    pub image_width: u32,

    /// GPU memory footprint in megabytes
    pub memory_mb: u64,

    /// Prefix sharing group; models in the same group share early layers
    #[serde(default)]
    pub prefix_share: Option<String>,

    /// Measured profiles, one per GPU device
    #[serde(default)]
    pub profiles: Vec<GpuProfile>,
}

impl ModelInfo {
    /// The database key: `framework:model:version`
    pub fn model_id(&self) -> String {
        format!("{}:{}:{}", self.framework, self.model_name, self.version)
    }

    /// Look up the profile for a GPU device
    pub fn profile(&self, gpu_device: &str) -> Option<&GpuProfile> {
        self.profiles.iter().find(|p| p.gpu_device == gpu_device)
    }
}

/// On-disk shape of the model index file
#[derive(Debug, Serialize, Deserialize)]
struct ModelDbFile {
    models: Vec<ModelInfo>,
}

/// The model database: model id -> metadata, plus prefix share groups
#[derive(Debug, Clone)]
pub struct ModelDatabase {
    models: HashMap<String, ModelInfo>,
    prefix_groups: HashMap<String, Vec<String>>,
}

impl ModelDatabase {
    /// Load the database from its root directory (expects `db.yml` inside)
    pub fn from_root(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join(DB_FILE);
        if !path.exists() {
            return Err(Error::model_db(format!(
                "model database index not found: {}",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(&path)?;
        let db = Self::from_yaml(&contents)?;
        tracing::info!(
            models = db.models.len(),
            root = %root.as_ref().display(),
            "Loaded model database"
        );
        Ok(db)
    }

    /// Parse a database from YAML contents
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let file: ModelDbFile = serde_yaml::from_str(contents)?;
        let mut models = HashMap::new();
        let mut prefix_groups: HashMap<String, Vec<String>> = HashMap::new();
        for info in file.models {
            let model_id = info.model_id();
            if let Some(group) = &info.prefix_share {
                prefix_groups
                    .entry(group.clone())
                    .or_default()
                    .push(model_id.clone());
            }
            if models.insert(model_id.clone(), info).is_some() {
                return Err(Error::model_db(format!("duplicate model id {}", model_id)));
            }
        }
        Ok(Self {
            models,
            prefix_groups,
        })
    }

    /// Look up a model by id
    pub fn get(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.get(model_id)
    }

    /// Model ids that share a prefix with the given model, excluding itself.
    /// Empty when the model is unknown or not in any sharing group.
    pub fn prefix_share_peers(&self, model_id: &str) -> Vec<String> {
        let Some(info) = self.models.get(model_id) else {
            return Vec::new();
        };
        let Some(group) = &info.prefix_share else {
            return Vec::new();
        };
        self.prefix_groups
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| id.as_str() != model_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of models in the database
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DB: &str = r#"
models:
  - framework: tensorflow
    model_name: resnet50
    version: 1
    resizable: true
    image_height: 224
    image_width: 224
    memory_mb: 1024
    prefix_share: resnet
    profiles:
      - gpu_device: mock-gpu
        forward_latency_us: [5000, 9000, 13000, 17000, 21000, 25000, 29000, 33000]
        preprocess_us: 500
        postprocess_us: 200
  - framework: tensorflow
    model_name: resnet152
    version: 1
    memory_mb: 2048
    prefix_share: resnet
    profiles:
      - gpu_device: mock-gpu
        forward_latency_us: [12000, 22000, 32000, 42000]
  - framework: caffe2
    model_name: mobilenet
    version: 1
    memory_mb: 256
    profiles:
      - gpu_device: mock-gpu
        forward_latency_us: [2000, 3500, 5000, 6500]
"#;

    #[test]
    fn test_yaml_round_trip() {
        let db = ModelDatabase::from_yaml(SAMPLE_DB).unwrap();
        assert_eq!(db.len(), 3);

        let info = db.get("tensorflow:resnet50:1").unwrap();
        assert!(info.resizable);
        assert_eq!(info.image_height, 224);
        assert_eq!(info.memory_mb, 1024);

        // Structure survives a serialize/deserialize cycle
        let yaml = serde_yaml::to_string(info).unwrap();
        let back: ModelInfo = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(&back, info);
    }

    #[test]
    fn test_prefix_share_peers() {
        let db = ModelDatabase::from_yaml(SAMPLE_DB).unwrap();
        let peers = db.prefix_share_peers("tensorflow:resnet50:1");
        assert_eq!(peers, vec!["tensorflow:resnet152:1".to_string()]);
        assert!(db.prefix_share_peers("caffe2:mobilenet:1").is_empty());
        assert!(db.prefix_share_peers("unknown:model:1").is_empty());
    }

    #[test]
    fn test_profile_math() {
        let db = ModelDatabase::from_yaml(SAMPLE_DB).unwrap();
        let profile = db
            .get("tensorflow:resnet50:1")
            .unwrap()
            .profile("mock-gpu")
            .unwrap();

        assert_eq!(profile.max_profiled_batch(), 8);
        assert_eq!(profile.forward_latency(1), Some(5000.0));
        assert_eq!(profile.forward_latency(0), None);
        assert_eq!(profile.forward_latency(9), None);

        // batch 4: 4 * 17000us = 68ms <= 100ms; batch 5: 5 * 21000 = 105ms > 100ms
        assert_eq!(profile.max_batch_under_sla(100), Some(4));
        let peak = profile.peak_throughput_under_sla(100).unwrap();
        assert!((peak - 4.0 * 1e6 / 17000.0).abs() < 1e-9);

        // SLA too tight for even batch 1
        assert_eq!(profile.max_batch_under_sla(4), None);
    }

    #[test]
    fn test_from_root_missing_index() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelDatabase::from_root(dir.path()).is_err());
    }

    #[test]
    fn test_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("db.yml"), SAMPLE_DB).unwrap();
        let db = ModelDatabase::from_root(dir.path()).unwrap();
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let dup = r#"
models:
  - framework: a
    model_name: m
    version: 1
    memory_mb: 1
  - framework: a
    model_name: m
    version: 1
    memory_mb: 2
"#;
        assert!(ModelDatabase::from_yaml(dup).is_err());
    }
}
