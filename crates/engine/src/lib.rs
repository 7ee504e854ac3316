//! Durable workflow execution.
//!
//! A workflow definition runs against a [`WorkflowContext`]. Side effects
//! go through the context as scheduling decisions that are appended to the
//! execution's history before they are dispatched. After a restart the
//! engine re-runs the definition from the beginning and answers every
//! decision that already has a recorded result from history, so completed
//! activities are never issued twice.

pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod execution;
pub mod history;
mod log;

pub use common::ExecutionId;
pub use context::WorkflowContext;
pub use definition::{ActivityCall, ActivityInvoker, WorkflowDefinition, WorkflowResult};
pub use engine::{ExecutionHandle, WorkflowEngine};
pub use error::{EngineError, Result};
pub use execution::{CompensationOutcome, ExecutionReport, ExecutionStatus, WorkflowExecution};
pub use history::{FailureCause, HistoryEvent, StepFailure};
pub use log::decode;
