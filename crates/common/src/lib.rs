//! Identifier types shared by every layer of the orchestration engine.

pub mod types;

pub use types::{ExecutionId, TaskId};
