//! Saga coordinator: drives a [`SagaDefinition`] through an [`ActivityInvoker`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine::{
    ActivityCall, ActivityInvoker, StepFailure, WorkflowContext, WorkflowDefinition,
    WorkflowResult,
};
use serde_json::{Map, Value};

use crate::definition::{SagaDefinition, StepOutcome};
use crate::state::{SagaRunState, SagaState};

/// How a saga run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaOutcome {
    /// Every forward action succeeded. Outputs are keyed by activity type.
    Completed { outputs: Map<String, Value> },

    /// A step failed (or the run was cancelled) and compensation ran.
    Failed {
        failure: StepFailure,
        completed_steps: Vec<usize>,
        /// Compensating activity types that did not succeed.
        compensation_failures: Vec<String>,
    },
}

impl SagaOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SagaOutcome::Completed { .. })
    }
}

/// Orchestrates the steps of one saga definition.
///
/// Forward actions run in step order. The first terminal failure switches
/// the run to compensation, which undoes every completed step in reverse
/// order. A cancellation seen after a step's result counts as that step
/// failing; its successful result is still compensated. A failed compensation is recorded and skipped; the remaining
/// compensations still run.
pub struct SagaCoordinator<'a> {
    definition: &'a SagaDefinition,
}

impl<'a> SagaCoordinator<'a> {
    pub fn new(definition: &'a SagaDefinition) -> Self {
        Self { definition }
    }

    #[tracing::instrument(skip(self, invoker, input), fields(saga = %self.definition.name()))]
    pub async fn run<I: ActivityInvoker>(
        &self,
        invoker: &mut I,
        input: Value,
    ) -> engine::Result<SagaOutcome> {
        let mut run = SagaRunState::default();
        let mut outputs: Vec<Option<Value>> = vec![None; self.definition.len()];

        for (index, step) in self.definition.steps().iter().enumerate() {
            run.start_step(index);
            tracing::debug!(state = %SagaState::Running(index), step = %step.name, "saga step started");

            let outcome = invoker
                .execute_activity(ActivityCall::new(
                    index,
                    step.forward.activity_type.clone(),
                    input.clone(),
                    step.forward.options.clone(),
                ))
                .await?;

            match StepOutcome::from(outcome) {
                StepOutcome::Success(output) => {
                    run.record_success(index);
                    outputs[index] = Some(output);

                    if let Some(reason) = invoker.cancel_requested().await? {
                        tracing::info!(step = %step.name, %reason, "cancellation observed");
                        let failure = StepFailure::cancelled(
                            index,
                            step.forward.activity_type.clone(),
                            reason,
                        );
                        return self.compensate(invoker, run, &outputs, failure).await;
                    }
                }
                StepOutcome::RetryableFailure { error, attempts }
                | StepOutcome::FatalFailure { error, attempts } => {
                    tracing::warn!(
                        step = %step.name,
                        attempts,
                        error = %error,
                        "saga step failed"
                    );
                    let failure = StepFailure::activity(
                        index,
                        step.forward.activity_type.clone(),
                        error,
                        attempts,
                    );
                    return self.compensate(invoker, run, &outputs, failure).await;
                }
            }
        }

        let outputs = self
            .definition
            .steps()
            .iter()
            .zip(outputs)
            .map(|(step, output)| {
                (
                    step.forward.activity_type.clone(),
                    output.unwrap_or(Value::Null),
                )
            })
            .collect();
        Ok(SagaOutcome::Completed { outputs })
    }

    async fn compensate<I: ActivityInvoker>(
        &self,
        invoker: &mut I,
        run: SagaRunState,
        outputs: &[Option<Value>],
        failure: StepFailure,
    ) -> engine::Result<SagaOutcome> {
        invoker.begin_compensation(failure.clone()).await?;

        let mut compensation_failures = Vec::new();
        for index in run.compensation_order() {
            let step = &self.definition.steps()[index];
            let Some(compensation) = &step.compensation else {
                continue;
            };
            tracing::debug!(state = %SagaState::Compensating(index), step = %step.name, "compensating step");

            let input = outputs[index].clone().unwrap_or(Value::Null);
            let outcome = invoker
                .execute_compensation(ActivityCall::new(
                    index,
                    compensation.activity_type.clone(),
                    input,
                    compensation.options.clone(),
                ))
                .await?;

            if let StepOutcome::RetryableFailure { error, attempts }
            | StepOutcome::FatalFailure { error, attempts } = StepOutcome::from(outcome)
            {
                metrics::counter!("compensation_failed_total").increment(1);
                tracing::warn!(
                    step = %step.name,
                    activity_type = %compensation.activity_type,
                    attempts,
                    error = %error,
                    "compensation failed, continuing with earlier steps"
                );
                compensation_failures.push(compensation.activity_type.clone());
            }
        }

        Ok(SagaOutcome::Failed {
            failure,
            completed_steps: run.completed_steps,
            compensation_failures,
        })
    }
}

/// Runs a [`SagaDefinition`] as a durable workflow.
pub struct SagaWorkflow {
    definition: SagaDefinition,
}

impl SagaWorkflow {
    pub fn new(definition: SagaDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &SagaDefinition {
        &self.definition
    }
}

#[async_trait]
impl WorkflowDefinition for SagaWorkflow {
    fn name(&self) -> &str {
        self.definition.name()
    }

    async fn run(&self, ctx: &mut WorkflowContext, input: Value) -> engine::Result<WorkflowResult> {
        let started_at: DateTime<Utc> = ctx.side_effect(Utc::now).await?;

        match SagaCoordinator::new(&self.definition)
            .run(ctx, input)
            .await?
        {
            SagaOutcome::Completed { outputs } => {
                let mut output = Map::new();
                output.insert("startedAt".to_string(), Value::String(started_at.to_rfc3339()));
                output.insert("steps".to_string(), Value::Object(outputs));
                Ok(WorkflowResult::Completed(Value::Object(output)))
            }
            SagaOutcome::Failed {
                failure,
                compensation_failures,
                ..
            } => {
                let mut reason = failure.to_string();
                if !compensation_failures.is_empty() {
                    reason.push_str(&format!(
                        "; compensation failed: {}",
                        compensation_failures.join(", ")
                    ));
                }
                Ok(WorkflowResult::Failed(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use activity::{ActivityError, ActivityOptions, ActivityOutcome};
    use engine::FailureCause;

    use super::*;
    use crate::definition::{ActivitySpec, Step};

    /// Answers activity calls from a per-type script and records every call.
    #[derive(Default)]
    struct ScriptedInvoker {
        script: HashMap<String, VecDeque<ActivityOutcome>>,
        calls: Vec<(bool, String, Value)>,
        compensation_started: Option<StepFailure>,
        cancel_after_calls: Option<usize>,
    }

    impl ScriptedInvoker {
        fn on(mut self, activity_type: &str, outcome: ActivityOutcome) -> Self {
            self.script
                .entry(activity_type.to_string())
                .or_default()
                .push_back(outcome);
            self
        }

        fn answer(&mut self, compensation: bool, call: ActivityCall) -> ActivityOutcome {
            self.calls
                .push((compensation, call.activity_type.clone(), call.input));
            self.script
                .get_mut(&call.activity_type)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| ok(serde_json::json!(call.activity_type)))
        }

        fn forward_calls(&self) -> Vec<&str> {
            self.calls
                .iter()
                .filter(|(c, _, _)| !c)
                .map(|(_, t, _)| t.as_str())
                .collect()
        }

        fn compensation_calls(&self) -> Vec<&str> {
            self.calls
                .iter()
                .filter(|(c, _, _)| *c)
                .map(|(_, t, _)| t.as_str())
                .collect()
        }
    }

    #[async_trait]
    impl ActivityInvoker for ScriptedInvoker {
        async fn execute_activity(&mut self, call: ActivityCall) -> engine::Result<ActivityOutcome> {
            Ok(self.answer(false, call))
        }

        async fn execute_compensation(
            &mut self,
            call: ActivityCall,
        ) -> engine::Result<ActivityOutcome> {
            Ok(self.answer(true, call))
        }

        async fn begin_compensation(&mut self, failure: StepFailure) -> engine::Result<()> {
            self.compensation_started = Some(failure);
            Ok(())
        }

        async fn cancel_requested(&mut self) -> engine::Result<Option<String>> {
            Ok(self
                .cancel_after_calls
                .filter(|n| self.calls.len() >= *n)
                .map(|_| "customer request".to_string()))
        }
    }

    fn ok(output: Value) -> ActivityOutcome {
        ActivityOutcome::Completed {
            output,
            attempts: 1,
        }
    }

    fn failed(error: ActivityError, attempts: u32) -> ActivityOutcome {
        ActivityOutcome::Failed { error, attempts }
    }

    /// a(undo_a) → b(no compensation) → c(undo_c) → d(undo_d)
    fn four_steps() -> SagaDefinition {
        let opts = ActivityOptions::new("Q");
        let spec = |t: &str| ActivitySpec::new(t, opts.clone());
        SagaDefinition::new("Four")
            .step(Step::new("a", spec("a")).with_compensation(spec("undo_a")))
            .step(Step::new("b", spec("b")))
            .step(Step::new("c", spec("c")).with_compensation(spec("undo_c")))
            .step(Step::new("d", spec("d")).with_compensation(spec("undo_d")))
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let saga = four_steps();
        let mut invoker = ScriptedInvoker::default().on("a", ok(serde_json::json!(42)));

        let outcome = SagaCoordinator::new(&saga)
            .run(&mut invoker, serde_json::json!({"orderId": 1}))
            .await
            .unwrap();

        let SagaOutcome::Completed { outputs } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(outputs["a"], serde_json::json!(42));
        assert_eq!(outputs.len(), 4);
        assert_eq!(invoker.forward_calls(), vec!["a", "b", "c", "d"]);
        assert!(invoker.compensation_calls().is_empty());
        assert!(invoker.compensation_started.is_none());
        assert!(
            invoker
                .calls
                .iter()
                .all(|(_, _, input)| *input == serde_json::json!({"orderId": 1}))
        );
    }

    #[tokio::test]
    async fn failure_compensates_completed_steps_in_reverse() {
        let saga = four_steps();
        let mut invoker = ScriptedInvoker::default()
            .on("a", ok(serde_json::json!("pay-1")))
            .on("c", ok(serde_json::json!("ship-1")))
            .on("d", failed(ActivityError::non_retryable("rejected"), 1));

        let outcome = SagaCoordinator::new(&saga)
            .run(&mut invoker, serde_json::json!({}))
            .await
            .unwrap();

        let SagaOutcome::Failed {
            failure,
            completed_steps,
            compensation_failures,
        } = outcome
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.step, 3);
        assert_eq!(failure.activity_type, "d");
        assert_eq!(completed_steps, vec![0, 1, 2]);
        assert!(compensation_failures.is_empty());

        // b has no compensation, d never completed.
        assert_eq!(invoker.compensation_calls(), vec!["undo_c", "undo_a"]);
        let inputs: Vec<&Value> = invoker
            .calls
            .iter()
            .filter(|(c, _, _)| *c)
            .map(|(_, _, input)| input)
            .collect();
        assert_eq!(inputs, vec![&serde_json::json!("ship-1"), &serde_json::json!("pay-1")]);
        assert_eq!(invoker.compensation_started, Some(failure));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_step() {
        let saga = four_steps();
        let mut invoker = ScriptedInvoker::default()
            .on("b", failed(ActivityError::retryable("provider down"), 3));

        let outcome = SagaCoordinator::new(&saga)
            .run(&mut invoker, serde_json::json!({}))
            .await
            .unwrap();

        let SagaOutcome::Failed { failure, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(
            failure.cause,
            FailureCause::Activity {
                error: ActivityError::retryable("provider down"),
                attempts: 3
            }
        );
        assert_eq!(invoker.forward_calls(), vec!["a", "b"]);
        assert_eq!(invoker.compensation_calls(), vec!["undo_a"]);
    }

    #[tokio::test]
    async fn first_step_failure_compensates_nothing() {
        let saga = four_steps();
        let mut invoker = ScriptedInvoker::default()
            .on("a", failed(ActivityError::retryable("down"), 3));

        let outcome = SagaCoordinator::new(&saga)
            .run(&mut invoker, serde_json::json!({}))
            .await
            .unwrap();

        let SagaOutcome::Failed {
            completed_steps, ..
        } = outcome
        else {
            panic!("expected failure");
        };
        assert!(completed_steps.is_empty());
        assert_eq!(invoker.forward_calls(), vec!["a"]);
        assert!(invoker.compensation_calls().is_empty());
        assert!(invoker.compensation_started.is_some());
    }

    #[tokio::test]
    async fn compensation_failure_does_not_stop_earlier_compensations() {
        let saga = four_steps();
        let mut invoker = ScriptedInvoker::default()
            .on("d", failed(ActivityError::non_retryable("rejected"), 1))
            .on("undo_c", failed(ActivityError::retryable("still down"), 3));

        let outcome = SagaCoordinator::new(&saga)
            .run(&mut invoker, serde_json::json!({}))
            .await
            .unwrap();

        let SagaOutcome::Failed {
            compensation_failures,
            ..
        } = outcome
        else {
            panic!("expected failure");
        };
        assert_eq!(compensation_failures, vec!["undo_c".to_string()]);
        assert_eq!(invoker.compensation_calls(), vec!["undo_c", "undo_a"]);
    }

    #[tokio::test]
    async fn cancellation_compensates_before_the_next_step() {
        let saga = four_steps();
        let mut invoker = ScriptedInvoker {
            cancel_after_calls: Some(1),
            ..ScriptedInvoker::default()
        };

        let outcome = SagaCoordinator::new(&saga)
            .run(&mut invoker, serde_json::json!({}))
            .await
            .unwrap();

        let SagaOutcome::Failed {
            failure,
            completed_steps,
            ..
        } = outcome
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.step, 0);
        assert_eq!(failure.activity_type, "a");
        assert!(matches!(failure.cause, FailureCause::Cancelled { .. }));
        assert_eq!(completed_steps, vec![0]);
        assert_eq!(invoker.forward_calls(), vec!["a"]);
        assert_eq!(invoker.compensation_calls(), vec!["undo_a"]);
    }

    #[tokio::test]
    async fn cancellation_during_last_step_compensates_everything() {
        let saga = four_steps();
        let mut invoker = ScriptedInvoker {
            cancel_after_calls: Some(4),
            ..ScriptedInvoker::default()
        };

        let outcome = SagaCoordinator::new(&saga)
            .run(&mut invoker, serde_json::json!({}))
            .await
            .unwrap();

        let SagaOutcome::Failed {
            failure,
            completed_steps,
            ..
        } = outcome
        else {
            panic!("expected cancellation to win over completion");
        };
        assert_eq!(failure.step, 3);
        assert!(matches!(failure.cause, FailureCause::Cancelled { .. }));
        assert_eq!(completed_steps, vec![0, 1, 2, 3]);
        assert_eq!(invoker.forward_calls(), vec!["a", "b", "c", "d"]);
        assert_eq!(
            invoker.compensation_calls(),
            vec!["undo_d", "undo_c", "undo_a"]
        );
    }

    #[tokio::test]
    async fn failed_step_wins_over_cancellation() {
        let saga = four_steps();
        let mut invoker = ScriptedInvoker {
            cancel_after_calls: Some(2),
            ..ScriptedInvoker::default()
        }
        .on("b", failed(ActivityError::non_retryable("rejected"), 1));

        let outcome = SagaCoordinator::new(&saga)
            .run(&mut invoker, serde_json::json!({}))
            .await
            .unwrap();

        let SagaOutcome::Failed { failure, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.step, 1);
        assert!(matches!(failure.cause, FailureCause::Activity { .. }));
        assert_eq!(invoker.compensation_calls(), vec!["undo_a"]);
    }
}
