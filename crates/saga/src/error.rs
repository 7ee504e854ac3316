//! Saga error types.

use engine::EngineError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The workflow input was rejected before the saga started.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
