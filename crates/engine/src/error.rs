use activity::DispatchError;
use common::ExecutionId;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors raised by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An execution with this id is currently running.
    #[error("Execution already running: {0}")]
    AlreadyRunning(ExecutionId),

    /// A finished execution already used this id.
    #[error("Execution id already used by a finished execution: {0}")]
    AlreadyExists(ExecutionId),

    #[error("Execution not found: {0}")]
    NotFound(ExecutionId),

    /// The execution exists but is no longer accepting requests.
    #[error("Execution is not active: {0}")]
    NotActive(ExecutionId),

    #[error("Unknown workflow definition: {0}")]
    UnknownDefinition(String),

    /// Re-execution diverged from the recorded history.
    #[error("Non-deterministic workflow at decision {seq}: expected {expected}, history has {recorded}")]
    NonDeterministic {
        seq: u64,
        expected: String,
        recorded: String,
    },

    /// The dispatcher dropped an activity before it resolved.
    #[error("Activity result lost: {0}")]
    ActivityResultLost(#[from] DispatchError),

    /// History could not be decoded or encoded.
    #[error("Invalid history: {0}")]
    InvalidHistory(String),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Errors after which the execution may be resumed by recovery.
    ///
    /// The engine leaves history non-terminal for these instead of
    /// recording a failure.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            EngineError::EventStore(_) | EngineError::ActivityResultLost(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
