//! Execution state folded from history.

use std::collections::HashMap;

use activity::ActivityError;
use common::ExecutionId;
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::history::{HistoryEvent, StepFailure};

/// Lifecycle status of a workflow execution.
///
/// ```text
/// RUNNING ──┬──► COMPLETED
///           └──► COMPENSATING ──► FAILED
/// ```
///
/// RUNNING can also go straight to FAILED when the workflow itself errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Compensating,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Compensating => "COMPENSATING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one compensating activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationOutcome {
    pub step: usize,
    pub activity_type: String,
    pub attempts: u32,
    /// Set when the compensation failed and was skipped.
    pub error: Option<ActivityError>,
}

impl CompensationOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Queryable summary of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub definition: String,
    pub status: ExecutionStatus,
    pub completed_steps: Vec<usize>,
    /// The step failure that started compensation.
    pub failure: Option<StepFailure>,
    pub compensations: Vec<CompensationOutcome>,
    pub output: Option<serde_json::Value>,
    /// Final failure reason as recorded in `WorkflowFailed`.
    pub reason: Option<String>,
    pub cancel_requested: Option<String>,
    pub history_length: i64,
}

/// An execution rebuilt by folding its history.
#[derive(Debug, Clone, Default)]
pub struct WorkflowExecution {
    execution_id: Option<ExecutionId>,
    definition: String,
    input: serde_json::Value,
    status: ExecutionStatus,
    version: Version,
    completed_steps: Vec<usize>,
    failure: Option<StepFailure>,
    compensations: Vec<CompensationOutcome>,
    output: Option<serde_json::Value>,
    reason: Option<String>,
    cancel_requested: Option<String>,
    /// seq -> (step, activity_type)
    scheduled: HashMap<u64, (usize, String)>,
}

impl WorkflowExecution {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Self::default()
        }
    }

    pub fn from_history<'a>(
        execution_id: ExecutionId,
        events: impl IntoIterator<Item = &'a HistoryEvent>,
    ) -> Self {
        let mut execution = Self::new(execution_id);
        for event in events {
            execution.apply(event);
        }
        execution
    }

    pub fn apply(&mut self, event: &HistoryEvent) {
        self.version = self.version.next();

        match event {
            HistoryEvent::WorkflowStarted(data) => {
                self.definition = data.definition.clone();
                self.input = data.input.clone();
                self.status = ExecutionStatus::Running;
            }
            HistoryEvent::ActivityScheduled(data) | HistoryEvent::CompensationScheduled(data) => {
                self.scheduled
                    .insert(data.seq, (data.step, data.activity_type.clone()));
            }
            HistoryEvent::ActivityCompleted(data) => {
                if let Some((step, _)) = self.scheduled.get(&data.seq)
                    && !self.completed_steps.contains(step)
                {
                    self.completed_steps.push(*step);
                }
            }
            HistoryEvent::ActivityFailed(_) => {
                // Recorded in CompensationStarted once the workflow reacts.
            }
            HistoryEvent::CompensationStarted(data) => {
                self.status = ExecutionStatus::Compensating;
                self.failure = Some(data.failure.clone());
            }
            HistoryEvent::CompensationCompleted(data) => {
                if let Some((step, activity_type)) = self.scheduled.get(&data.seq) {
                    self.compensations.push(CompensationOutcome {
                        step: *step,
                        activity_type: activity_type.clone(),
                        attempts: data.attempts,
                        error: None,
                    });
                }
            }
            HistoryEvent::CompensationFailed(data) => {
                if let Some((step, activity_type)) = self.scheduled.get(&data.seq) {
                    self.compensations.push(CompensationOutcome {
                        step: *step,
                        activity_type: activity_type.clone(),
                        attempts: data.attempts,
                        error: Some(data.error.clone()),
                    });
                }
            }
            HistoryEvent::ActivityAttemptFailed(_) | HistoryEvent::SideEffectRecorded(_) => {}
            HistoryEvent::CancelRequested(data) => {
                if self.cancel_requested.is_none() {
                    self.cancel_requested = Some(data.reason.clone());
                }
            }
            HistoryEvent::WorkflowCompleted(data) => {
                self.status = ExecutionStatus::Completed;
                self.output = Some(data.output.clone());
            }
            HistoryEvent::WorkflowFailed(data) => {
                self.status = ExecutionStatus::Failed;
                self.reason = Some(data.reason.clone());
            }
        }
    }

    pub fn execution_id(&self) -> Option<&ExecutionId> {
        self.execution_id.as_ref()
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn completed_steps(&self) -> &[usize] {
        &self.completed_steps
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        self.failure.as_ref()
    }

    pub fn compensations(&self) -> &[CompensationOutcome] {
        &self.compensations
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn report(&self) -> ExecutionReport {
        ExecutionReport {
            execution_id: self
                .execution_id
                .clone()
                .unwrap_or_else(|| ExecutionId::new("")),
            definition: self.definition.clone(),
            status: self.status,
            completed_steps: self.completed_steps.clone(),
            failure: self.failure.clone(),
            compensations: self.compensations.clone(),
            output: self.output.clone(),
            reason: self.reason.clone(),
            cancel_requested: self.cancel_requested.clone(),
            history_length: self.version.as_i64(),
        }
    }
}
