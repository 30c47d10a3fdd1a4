//! Error types for the CXR-ViT training system

use thiserror::Error;

/// Main error type for training and evaluation operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration names something this build cannot run
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The training loss diverged; the run must stop
    #[error("Loss is {value}, stopping training")]
    NonFiniteLoss {
        /// The offending (unscaled) loss value
        value: f64,
    },

    /// Checkpoint read/write or state restoration error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Cross-worker collective communication error
    #[error("Collective error: {0}")]
    Collective(String),

    /// Dataset or batch error
    #[error("Data error: {0}")]
    Data(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary checkpoint encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Layered configuration source error
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for CXR-ViT operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unsupported-option error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a collective communication error
    pub fn collective(msg: impl Into<String>) -> Self {
        Self::Collective(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Whether this error is the fatal numerical-divergence condition
    pub fn is_non_finite_loss(&self) -> bool {
        matches!(self, Self::NonFiniteLoss { .. })
    }
}
