//! Workflow history events.
//!
//! The history is the only durable record of an execution. Every decision
//! the workflow makes is appended here before it takes effect, and replay
//! rebuilds in-memory state from nothing but this sequence.

use std::time::Duration;

use activity::{ActivityError, ActivityOutcome};
use serde::{Deserialize, Serialize};

/// A fact recorded in an execution's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HistoryEvent {
    WorkflowStarted(WorkflowStartedData),

    /// A forward activity was handed to the dispatcher.
    ActivityScheduled(ActivityScheduledData),
    ActivityCompleted(ActivityCompletedData),
    /// A forward activity failed terminally (exhausted or non-retryable).
    ActivityFailed(ActivityFailedData),
    /// One attempt of a forward or compensating activity failed and will
    /// be retried. Recorded before the next attempt is released.
    ActivityAttemptFailed(AttemptFailedData),

    /// The workflow switched to undoing completed steps.
    CompensationStarted(CompensationStartedData),
    CompensationScheduled(ActivityScheduledData),
    CompensationCompleted(ActivityCompletedData),
    /// Best-effort: recorded and skipped.
    CompensationFailed(ActivityFailedData),

    /// A non-deterministic value produced once and reused on replay.
    SideEffectRecorded(SideEffectData),

    CancelRequested(CancelRequestedData),

    WorkflowCompleted(WorkflowCompletedData),
    WorkflowFailed(WorkflowFailedData),
}

impl HistoryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            HistoryEvent::WorkflowStarted(_) => "WorkflowStarted",
            HistoryEvent::ActivityScheduled(_) => "ActivityScheduled",
            HistoryEvent::ActivityCompleted(_) => "ActivityCompleted",
            HistoryEvent::ActivityFailed(_) => "ActivityFailed",
            HistoryEvent::ActivityAttemptFailed(_) => "ActivityAttemptFailed",
            HistoryEvent::CompensationStarted(_) => "CompensationStarted",
            HistoryEvent::CompensationScheduled(_) => "CompensationScheduled",
            HistoryEvent::CompensationCompleted(_) => "CompensationCompleted",
            HistoryEvent::CompensationFailed(_) => "CompensationFailed",
            HistoryEvent::SideEffectRecorded(_) => "SideEffectRecorded",
            HistoryEvent::CancelRequested(_) => "CancelRequested",
            HistoryEvent::WorkflowCompleted(_) => "WorkflowCompleted",
            HistoryEvent::WorkflowFailed(_) => "WorkflowFailed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HistoryEvent::WorkflowCompleted(_) | HistoryEvent::WorkflowFailed(_)
        )
    }

    /// Decision sequence number, for events tied to a scheduling point.
    pub fn seq(&self) -> Option<u64> {
        match self {
            HistoryEvent::ActivityScheduled(d) | HistoryEvent::CompensationScheduled(d) => {
                Some(d.seq)
            }
            HistoryEvent::ActivityCompleted(d) | HistoryEvent::CompensationCompleted(d) => {
                Some(d.seq)
            }
            HistoryEvent::ActivityFailed(d) | HistoryEvent::CompensationFailed(d) => Some(d.seq),
            HistoryEvent::ActivityAttemptFailed(d) => Some(d.seq),
            HistoryEvent::SideEffectRecorded(d) => Some(d.seq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartedData {
    /// Name of the registered workflow definition.
    pub definition: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityScheduledData {
    pub seq: u64,
    /// Saga step the activity belongs to.
    pub step: usize,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCompletedData {
    pub seq: u64,
    pub output: serde_json::Value,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityFailedData {
    pub seq: u64,
    pub error: ActivityError,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailedData {
    pub seq: u64,
    pub attempt: u32,
    pub error: ActivityError,
    /// Backoff the dispatcher applied before the next attempt.
    pub retry_delay_ms: u64,
}

impl AttemptFailedData {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStartedData {
    pub failure: StepFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffectData {
    pub seq: u64,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequestedData {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCompletedData {
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailedData {
    pub reason: String,
}

/// Why a step ended the forward phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The activity failed terminally.
    Activity { error: ActivityError, attempts: u32 },
    /// The execution was cancelled while the step was in flight.
    Cancelled { reason: String },
}

/// The step failure that triggered compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: usize,
    pub activity_type: String,
    pub cause: FailureCause,
}

impl StepFailure {
    pub fn activity(
        step: usize,
        activity_type: impl Into<String>,
        error: ActivityError,
        attempts: u32,
    ) -> Self {
        Self {
            step,
            activity_type: activity_type.into(),
            cause: FailureCause::Activity { error, attempts },
        }
    }

    pub fn cancelled(step: usize, activity_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step,
            activity_type: activity_type.into(),
            cause: FailureCause::Cancelled {
                reason: reason.into(),
            },
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            FailureCause::Activity { error, attempts } => write!(
                f,
                "{} failed after {} attempt(s): {}",
                self.activity_type, attempts, error
            ),
            FailureCause::Cancelled { reason } => {
                write!(f, "cancelled during {}: {}", self.activity_type, reason)
            }
        }
    }
}

// Convenience constructors
impl HistoryEvent {
    pub fn workflow_started(definition: impl Into<String>, input: serde_json::Value) -> Self {
        HistoryEvent::WorkflowStarted(WorkflowStartedData {
            definition: definition.into(),
            input,
        })
    }

    /// Terminal event for a forward or compensating activity.
    pub fn activity_result(seq: u64, compensation: bool, outcome: &ActivityOutcome) -> Self {
        match (outcome, compensation) {
            (ActivityOutcome::Completed { output, attempts }, false) => {
                HistoryEvent::ActivityCompleted(ActivityCompletedData {
                    seq,
                    output: output.clone(),
                    attempts: *attempts,
                })
            }
            (ActivityOutcome::Completed { output, attempts }, true) => {
                HistoryEvent::CompensationCompleted(ActivityCompletedData {
                    seq,
                    output: output.clone(),
                    attempts: *attempts,
                })
            }
            (ActivityOutcome::Failed { error, attempts }, false) => {
                HistoryEvent::ActivityFailed(ActivityFailedData {
                    seq,
                    error: error.clone(),
                    attempts: *attempts,
                })
            }
            (ActivityOutcome::Failed { error, attempts }, true) => {
                HistoryEvent::CompensationFailed(ActivityFailedData {
                    seq,
                    error: error.clone(),
                    attempts: *attempts,
                })
            }
        }
    }

    pub fn attempt_failed(seq: u64, attempt: u32, error: ActivityError, retry_delay: Duration) -> Self {
        HistoryEvent::ActivityAttemptFailed(AttemptFailedData {
            seq,
            attempt,
            error,
            retry_delay_ms: u64::try_from(retry_delay.as_millis()).unwrap_or(u64::MAX),
        })
    }

    pub fn compensation_started(failure: StepFailure) -> Self {
        HistoryEvent::CompensationStarted(CompensationStartedData { failure })
    }

    pub fn side_effect_recorded(seq: u64, value: serde_json::Value) -> Self {
        HistoryEvent::SideEffectRecorded(SideEffectData { seq, value })
    }

    pub fn cancel_requested(reason: impl Into<String>) -> Self {
        HistoryEvent::CancelRequested(CancelRequestedData {
            reason: reason.into(),
        })
    }

    pub fn workflow_completed(output: serde_json::Value) -> Self {
        HistoryEvent::WorkflowCompleted(WorkflowCompletedData { output })
    }

    pub fn workflow_failed(reason: impl Into<String>) -> Self {
        HistoryEvent::WorkflowFailed(WorkflowFailedData {
            reason: reason.into(),
        })
    }

    /// Converts a recorded terminal activity event back into its outcome.
    pub fn as_outcome(&self) -> Option<ActivityOutcome> {
        match self {
            HistoryEvent::ActivityCompleted(d) | HistoryEvent::CompensationCompleted(d) => {
                Some(ActivityOutcome::Completed {
                    output: d.output.clone(),
                    attempts: d.attempts,
                })
            }
            HistoryEvent::ActivityFailed(d) | HistoryEvent::CompensationFailed(d) => {
                Some(ActivityOutcome::Failed {
                    error: d.error.clone(),
                    attempts: d.attempts,
                })
            }
            _ => None,
        }
    }
}
