//! Activity and dispatch error types.

use common::TaskId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an activity failure should be treated by the retry evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transient fault; retry per policy.
    Retryable,
    /// Permanent fault classified by the activity; fail the step at once.
    NonRetryable,
    /// No completion report within the start-to-close timeout.
    /// Treated as transient unless it happens on the final attempt.
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "Retryable",
            FailureKind::NonRetryable => "NonRetryable",
            FailureKind::Timeout => "Timeout",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure reported for one activity attempt.
///
/// This is a value, not just an error: it is recorded in workflow
/// history and replayed, so it must be serializable and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ActivityError {
    pub kind: FailureKind,
    pub message: String,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NonRetryable,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }

    /// Returns true unless the activity classified the failure as permanent.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, FailureKind::NonRetryable)
    }
}

/// Errors returned by the dispatcher's reporting API.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The task has no outstanding attempt (already resolved or never scheduled).
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// A report arrived for an attempt that is no longer current,
    /// typically a worker finishing after its attempt timed out.
    #[error("Stale report for task {task_id}: attempt {attempt}, current attempt {current}")]
    StaleAttempt {
        task_id: TaskId,
        attempt: u32,
        current: u32,
    },

    /// The dispatcher dropped the task without a terminal result.
    #[error("Dispatcher closed before task {0} resolved")]
    Closed(TaskId),
}
