//! Activity task types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ExecutionId, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::ActivityError;
use crate::retry::RetryPolicy;

/// Per-invocation options: where the task goes and how it is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    pub task_queue: String,
    pub retry_policy: RetryPolicy,
    pub start_to_close_timeout: Duration,
}

impl ActivityOptions {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

/// One activity invocation as seen by a worker.
///
/// The task id is stable across retries; `attempt` is 1-based and grows
/// with each redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTask {
    pub task_id: TaskId,
    pub execution_id: ExecutionId,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub task_queue: String,
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub start_to_close_timeout: Duration,
    /// Stable across attempts and process restarts; activities use it
    /// to deduplicate redelivered work.
    pub idempotency_key: String,
}

impl ActivityTask {
    pub fn new(
        execution_id: ExecutionId,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: &ActivityOptions,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            execution_id,
            activity_type: activity_type.into(),
            input,
            task_queue: options.task_queue.clone(),
            attempt: 1,
            scheduled_at: Utc::now(),
            start_to_close_timeout: options.start_to_close_timeout,
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Resumes numbering at `attempt`, e.g. after earlier attempts were
    /// recorded by a previous process.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    /// Handle identifying this particular attempt.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.task_id,
            attempt: self.attempt,
        }
    }
}

/// Identifies one delivery (task + attempt) for completion reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub attempt: u32,
}

/// Terminal result of an activity after the retry policy has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActivityOutcome {
    Completed {
        output: serde_json::Value,
        attempts: u32,
    },
    Failed {
        error: ActivityError,
        attempts: u32,
    },
}

impl ActivityOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            ActivityOutcome::Completed { attempts, .. } | ActivityOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ActivityOutcome::Completed { .. })
    }
}
