//! Error types for the searched Wide ResNet

use thiserror::Error;

/// Result type alias for crate operations
pub type Result<T> = std::result::Result<T, NasError>;

/// Main error type
#[derive(Error, Debug)]
pub enum NasError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("Tensor error: {0}")]
    TensorError(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape for {name}: expected {expected}, got {actual}")]
    ShapeError {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Missing keys in state dict: {0:?}")]
    MissingKeys(Vec<String>),

    #[error("Unexpected keys in state dict: {0:?}")]
    UnexpectedKeys(Vec<String>),

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Index out of range: {what} {index} (len {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },
}

impl From<serde_json::Error> for NasError {
    fn from(err: serde_json::Error) -> Self {
        NasError::SerializationError(err.to_string())
    }
}

impl NasError {
    pub(crate) fn invalid(name: &str, value: impl ToString, reason: &str) -> Self {
        NasError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
