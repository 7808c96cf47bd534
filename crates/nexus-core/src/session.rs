//! Model session identifiers
//!
//! A model session fully qualifies a served model: model identity plus the
//! latency SLA and optional input dimensions. Its canonical string encoding
//! is the map key everywhere in the fabric.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully qualified model session.
///
/// Image dimensions of zero mean "unset"; the scheduler resolves defaults
/// from the model database when the model is resizable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSession {
    /// Framework the model runs on (e.g. "tensorflow", "caffe2")
    pub framework: String,

    /// Model name (e.g. "resnet50")
    pub model_name: String,

    /// Model version
    pub version: u32,

    /// Latency SLA in milliseconds
    pub latency_sla_ms: u32,

    /// Input image height (0 = unset)
    pub image_height: u32,

    /// Input image width (0 = unset)
    pub image_width: u32,
}

impl ModelSession {
    /// Create a session without explicit input dimensions
    pub fn new(
        framework: impl Into<String>,
        model_name: impl Into<String>,
        version: u32,
        latency_sla_ms: u32,
    ) -> Self {
        Self {
            framework: framework.into(),
            model_name: model_name.into(),
            version,
            latency_sla_ms,
            image_height: 0,
            image_width: 0,
        }
    }

    /// Set explicit input dimensions
    pub fn with_dims(mut self, height: u32, width: u32) -> Self {
        self.image_height = height;
        self.image_width = width;
        self
    }

    /// Whether input dimensions have been resolved
    pub fn has_dims(&self) -> bool {
        self.image_height > 0 && self.image_width > 0
    }

    /// The model database key: `framework:model:version`
    pub fn model_id(&self) -> String {
        format!("{}:{}:{}", self.framework, self.model_name, self.version)
    }

    /// The canonical session id: `framework:model:version:sla[:HxW]`
    pub fn session_id(&self) -> String {
        if self.has_dims() {
            format!(
                "{}:{}:{}:{}:{}x{}",
                self.framework,
                self.model_name,
                self.version,
                self.latency_sla_ms,
                self.image_height,
                self.image_width
            )
        } else {
            format!(
                "{}:{}:{}:{}",
                self.framework, self.model_name, self.version, self.latency_sla_ms
            )
        }
    }

    /// Parse a canonical session id back into a session
    pub fn parse(id: &str) -> Result<Self> {
        let tokens: Vec<&str> = id.split(':').collect();
        if tokens.len() != 4 && tokens.len() != 5 {
            return Err(Error::invalid_session(id));
        }
        let version = tokens[2]
            .parse::<u32>()
            .map_err(|_| Error::invalid_session(id))?;
        let latency_sla_ms = tokens[3]
            .parse::<u32>()
            .map_err(|_| Error::invalid_session(id))?;
        let mut sess = ModelSession::new(tokens[0], tokens[1], version, latency_sla_ms);
        if tokens.len() == 5 {
            let dims: Vec<&str> = tokens[4].split('x').collect();
            if dims.len() != 2 {
                return Err(Error::invalid_session(id));
            }
            let height = dims[0]
                .parse::<u32>()
                .map_err(|_| Error::invalid_session(id))?;
            let width = dims[1]
                .parse::<u32>()
                .map_err(|_| Error::invalid_session(id))?;
            sess = sess.with_dims(height, width);
        }
        Ok(sess)
    }
}

impl fmt::Display for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.session_id())
    }
}
