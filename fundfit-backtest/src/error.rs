//! Error types for scoring, optimization and validation.

use thiserror::Error;

use crate::data::LoaderError;

/// Main error type for the research pipeline.
///
/// `InsufficientData` is recoverable at the window level: the walk-forward
/// loop skips the window and keeps going. Everything else aborts the run.
#[derive(Error, Debug)]
pub enum ResearchError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Loader(#[from] LoaderError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResearchError {
    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error only invalidates the current unit of work.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Self::InsufficientData(_))
    }
}

/// Result type alias for research operations.
pub type Result<T> = std::result::Result<T, ResearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_is_recoverable() {
        assert!(ResearchError::insufficient("empty window").is_insufficient_data());
        assert!(!ResearchError::config("top_k must be positive").is_insufficient_data());
    }

    #[test]
    fn test_error_messages() {
        let err = ResearchError::config("unknown feature: foo");
        assert_eq!(err.to_string(), "Invalid configuration: unknown feature: foo");
    }
}
