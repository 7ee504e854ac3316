//! Saga definitions: ordered steps with optional compensations.

use activity::{ActivityError, ActivityOptions, ActivityOutcome};

/// An activity type together with the options it is dispatched with.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySpec {
    pub activity_type: String,
    pub options: ActivityOptions,
}

impl ActivitySpec {
    pub fn new(activity_type: impl Into<String>, options: ActivityOptions) -> Self {
        Self {
            activity_type: activity_type.into(),
            options,
        }
    }
}

/// One saga step.
///
/// The forward activity receives the saga input. The compensation, if
/// any, receives the forward activity's output.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub forward: ActivitySpec,
    pub compensation: Option<ActivitySpec>,
}

impl Step {
    pub fn new(name: impl Into<String>, forward: ActivitySpec) -> Self {
        Self {
            name: name.into(),
            forward,
            compensation: None,
        }
    }

    pub fn with_compensation(mut self, compensation: ActivitySpec) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn is_compensable(&self) -> bool {
        self.compensation.is_some()
    }
}

/// A named, linear sequence of steps.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<Step>,
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of a step's forward activity, as the coordinator branches on it.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(serde_json::Value),
    /// Transient failures that outlasted the retry policy.
    RetryableFailure { error: ActivityError, attempts: u32 },
    /// Failure the activity classified as permanent.
    FatalFailure { error: ActivityError, attempts: u32 },
}

impl From<ActivityOutcome> for StepOutcome {
    fn from(outcome: ActivityOutcome) -> Self {
        match outcome {
            ActivityOutcome::Completed { output, .. } => StepOutcome::Success(output),
            ActivityOutcome::Failed { error, attempts } if error.is_retryable() => {
                StepOutcome::RetryableFailure { error, attempts }
            }
            ActivityOutcome::Failed { error, attempts } => {
                StepOutcome::FatalFailure { error, attempts }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_step_order() {
        let opts = ActivityOptions::new("Q");
        let saga = SagaDefinition::new("Test")
            .step(
                Step::new("pay", ActivitySpec::new("debit", opts.clone()))
                    .with_compensation(ActivitySpec::new("refund", opts.clone())),
            )
            .step(Step::new("ship", ActivitySpec::new("ship", opts)));

        assert_eq!(saga.len(), 2);
        assert_eq!(saga.steps()[0].name, "pay");
        assert!(saga.steps()[0].is_compensable());
        assert!(!saga.steps()[1].is_compensable());
    }

    #[test]
    fn outcome_classification() {
        let ok = StepOutcome::from(ActivityOutcome::Completed {
            output: serde_json::json!(1),
            attempts: 1,
        });
        assert_eq!(ok, StepOutcome::Success(serde_json::json!(1)));

        let exhausted = StepOutcome::from(ActivityOutcome::Failed {
            error: ActivityError::retryable("down"),
            attempts: 3,
        });
        assert!(matches!(exhausted, StepOutcome::RetryableFailure { attempts: 3, .. }));

        let timed_out = StepOutcome::from(ActivityOutcome::Failed {
            error: ActivityError::timeout("silent"),
            attempts: 3,
        });
        assert!(matches!(timed_out, StepOutcome::RetryableFailure { .. }));

        let fatal = StepOutcome::from(ActivityOutcome::Failed {
            error: ActivityError::non_retryable("bad"),
            attempts: 1,
        });
        assert!(matches!(fatal, StepOutcome::FatalFailure { .. }));
    }
}
