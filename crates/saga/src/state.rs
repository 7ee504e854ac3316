//! Saga state machine.

use std::collections::HashMap;

use engine::HistoryEvent;
use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle, for `n` steps.
///
/// State transitions:
/// ```text
/// Idle ──► Running(0) ──► … ──► Running(n-1) ──┬──► Completed
///              │                                │
///              └──────────────┬─────────────────┘  (step i fails)
///                             ▼
///              Compensating(k) for k in completed steps, reversed ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Saga has not started yet.
    #[default]
    Idle,

    /// The forward action of step `i` is in progress.
    Running(usize),

    /// The compensation of step `k` is in progress.
    Compensating(usize),

    /// All steps completed successfully (terminal state).
    Completed,

    /// Compensation finished after a failure (terminal state).
    Failed,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    pub fn is_compensating(&self) -> bool {
        matches!(self, SagaState::Compensating(_))
    }

    /// Reconstructs the state from an execution's history.
    pub fn from_history(events: &[HistoryEvent]) -> Self {
        let mut state = SagaState::Idle;
        for event in events {
            state = match event {
                HistoryEvent::WorkflowStarted(_) => SagaState::Running(0),
                HistoryEvent::ActivityScheduled(d) => SagaState::Running(d.step),
                HistoryEvent::CompensationStarted(d) => SagaState::Compensating(d.failure.step),
                HistoryEvent::CompensationScheduled(d) => SagaState::Compensating(d.step),
                HistoryEvent::WorkflowCompleted(_) => SagaState::Completed,
                HistoryEvent::WorkflowFailed(_) => SagaState::Failed,
                _ => state,
            };
        }
        state
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SagaState::Idle => write!(f, "IDLE"),
            SagaState::Running(i) => write!(f, "RUNNING({i})"),
            SagaState::Compensating(k) => write!(f, "COMPENSATING({k})"),
            SagaState::Completed => write!(f, "COMPLETED"),
            SagaState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Progress of the forward phase.
///
/// Always derived from history (live or replayed), never stored on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaRunState {
    pub current_step_index: usize,
    /// Steps whose forward action succeeded, in increasing order.
    pub completed_steps: Vec<usize>,
}

impl SagaRunState {
    pub fn start_step(&mut self, step: usize) {
        self.current_step_index = step;
    }

    /// Records a successful forward action. Out-of-order steps are ignored.
    pub fn record_success(&mut self, step: usize) {
        if self.completed_steps.last().is_none_or(|last| *last < step) {
            self.completed_steps.push(step);
        }
    }

    pub fn is_completed(&self, step: usize) -> bool {
        self.completed_steps.contains(&step)
    }

    /// Completed steps in the order they must be compensated.
    pub fn compensation_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.completed_steps.iter().rev().copied()
    }

    /// Reconstructs the forward progress from an execution's history.
    pub fn from_history(events: &[HistoryEvent]) -> Self {
        let mut run = SagaRunState::default();
        let mut forward_steps = HashMap::new();
        for event in events {
            match event {
                HistoryEvent::ActivityScheduled(d) => {
                    forward_steps.insert(d.seq, d.step);
                    run.start_step(d.step);
                }
                HistoryEvent::ActivityCompleted(d) => {
                    if let Some(step) = forward_steps.get(&d.seq) {
                        run.record_success(*step);
                    }
                }
                _ => {}
            }
        }
        run
    }
}
