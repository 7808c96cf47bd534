//! Error handling for nexus
//!
//! Provides a unified error type and result alias used across all nexus
//! components.

/// Result type alias for nexus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for nexus
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Malformed model session identifier
    #[error("Invalid model session: {0}")]
    InvalidModelSession(String),

    /// Model database errors
    #[error("Model database error: {0}")]
    ModelDatabase(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid model session error
    pub fn invalid_session(msg: impl Into<String>) -> Self {
        Self::InvalidModelSession(msg.into())
    }

    /// Create a model database error
    pub fn model_db(msg: impl Into<String>) -> Self {
        Self::ModelDatabase(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::InvalidModelSession(_) => "model_session",
            Error::ModelDatabase(_) => "model_db",
            Error::NotFound(_) => "not_found",
            Error::Network(_) => "network",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Yaml(_) => "yaml",
            Error::Json(_) => "json",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("bad beacon interval");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Configuration error: bad beacon interval");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::config("x").category(), "configuration");
        assert_eq!(Error::invalid_session("x").category(), "model_session");
        assert_eq!(Error::not_found("x").category(), "not_found");
    }
}
