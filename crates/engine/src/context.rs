//! The replay-aware handle a workflow definition runs against.

use std::sync::Arc;
use std::time::Duration;

use activity::{ActivityDispatcher, ActivityEvent, ActivityOutcome, ActivityTask};
use async_trait::async_trait;
use common::ExecutionId;
use event_store::{EventStore, Version};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::definition::{ActivityCall, ActivityInvoker};
use crate::error::{EngineError, Result};
use crate::history::{ActivityScheduledData, HistoryEvent, StepFailure};
use crate::log::SharedLog;

/// Execution-scoped context passed to [`WorkflowDefinition::run`].
///
/// Every decision gets a sequence number in the order the workflow makes
/// it. A decision whose result is already in history is answered from
/// history; only new decisions reach the dispatcher. Failed attempts are
/// recorded as they happen, so a re-dispatched activity continues its
/// attempt count instead of starting over.
///
/// [`WorkflowDefinition::run`]: crate::WorkflowDefinition::run
pub struct WorkflowContext {
    execution_id: ExecutionId,
    log: SharedLog,
    store: Arc<dyn EventStore>,
    dispatcher: ActivityDispatcher,
    next_seq: u64,
    /// History position of the last result handed to the workflow.
    observed: Version,
}

impl WorkflowContext {
    pub(crate) fn new(
        execution_id: ExecutionId,
        log: SharedLog,
        store: Arc<dyn EventStore>,
        dispatcher: ActivityDispatcher,
    ) -> Self {
        Self {
            execution_id,
            log,
            store,
            dispatcher,
            next_seq: 0,
            observed: Version::first(),
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Runs `produce` once and records its value; replays return the
    /// recorded value without calling `produce`.
    #[tracing::instrument(skip(self, produce), fields(execution_id = %self.execution_id))]
    pub async fn side_effect<T, F>(&mut self, produce: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> T + Send,
    {
        let seq = self.next_seq();
        let mut log = self.log.lock().await;

        if let Some(recorded) = log.side_effect(seq) {
            return Ok(serde_json::from_value(recorded.value.clone())?);
        }
        if let Some(recorded) = log.recorded_kind(seq) {
            return Err(EngineError::NonDeterministic {
                seq,
                expected: "SideEffectRecorded".to_string(),
                recorded: recorded.to_string(),
            });
        }

        let value = produce();
        log.append(
            self.store.as_ref(),
            HistoryEvent::side_effect_recorded(seq, serde_json::to_value(&value)?),
        )
        .await?;
        Ok(value)
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    async fn schedule(&mut self, call: ActivityCall, compensation: bool) -> Result<ActivityOutcome> {
        let seq = self.next_seq();
        let expected = describe(compensation, &call.activity_type);
        let policy = call.options.retry_policy.clone();
        let mut attempt = 1;
        let mut delay = Duration::ZERO;

        let mut log = self.log.lock().await;
        let recorded = log
            .scheduled(seq)
            .map(|(was_compensation, data)| describe(was_compensation, &data.activity_type));

        match recorded {
            Some(recorded) if recorded != expected => {
                return Err(EngineError::NonDeterministic {
                    seq,
                    expected,
                    recorded,
                });
            }
            Some(_) => {
                if let Some(result) = log.result(seq) {
                    let outcome = result.event.as_outcome().ok_or_else(|| {
                        EngineError::InvalidHistory(format!("decision {seq} has no outcome"))
                    })?;
                    self.observed = self.observed.max(result.version);
                    tracing::debug!(
                        execution_id = %self.execution_id,
                        seq,
                        activity_type = %call.activity_type,
                        "activity result replayed from history"
                    );
                    return Ok(outcome);
                }

                if let Some(last) = log.last_failed_attempt(seq).cloned() {
                    if last.attempt >= policy.effective_max_attempts() {
                        let outcome = ActivityOutcome::Failed {
                            error: last.error.clone(),
                            attempts: last.attempt,
                        };
                        self.observed = log
                            .append(
                                self.store.as_ref(),
                                HistoryEvent::activity_result(seq, compensation, &outcome),
                            )
                            .await?;
                        tracing::warn!(
                            execution_id = %self.execution_id,
                            seq,
                            activity_type = %call.activity_type,
                            attempts = last.attempt,
                            "recorded attempts exhaust the retry policy"
                        );
                        return Ok(outcome);
                    }
                    attempt = last.attempt + 1;
                    delay = last.retry_delay();
                }
                tracing::info!(
                    execution_id = %self.execution_id,
                    seq,
                    activity_type = %call.activity_type,
                    attempt,
                    "re-dispatching activity scheduled before restart"
                );
            }
            None => {
                if let Some(kind) = log.recorded_kind(seq) {
                    return Err(EngineError::NonDeterministic {
                        seq,
                        expected,
                        recorded: kind.to_string(),
                    });
                }
                let data = ActivityScheduledData {
                    seq,
                    step: call.step,
                    activity_type: call.activity_type.clone(),
                    task_queue: call.options.task_queue.clone(),
                    input: call.input.clone(),
                };
                let event = if compensation {
                    HistoryEvent::CompensationScheduled(data)
                } else {
                    HistoryEvent::ActivityScheduled(data)
                };
                log.append(self.store.as_ref(), event).await?;
            }
        }
        drop(log);

        let task = ActivityTask::new(
            self.execution_id.clone(),
            call.activity_type.clone(),
            call.input,
            &call.options,
            format!("{}/{}", self.execution_id, seq),
        )
        .with_attempt(attempt);
        let mut scheduled = self.dispatcher.schedule_durable(task, policy, delay);

        let outcome = loop {
            match scheduled.next_event().await? {
                ActivityEvent::Retry(retry) => {
                    self.log
                        .lock()
                        .await
                        .append(
                            self.store.as_ref(),
                            HistoryEvent::attempt_failed(
                                seq,
                                retry.attempt,
                                retry.error.clone(),
                                retry.delay,
                            ),
                        )
                        .await?;
                    retry.acknowledge();
                }
                ActivityEvent::Resolved(outcome) => break outcome,
            }
        };

        let mut log = self.log.lock().await;
        self.observed = log
            .append(
                self.store.as_ref(),
                HistoryEvent::activity_result(seq, compensation, &outcome),
            )
            .await?;
        Ok(outcome)
    }
}

fn describe(compensation: bool, activity_type: &str) -> String {
    if compensation {
        format!("CompensationScheduled({activity_type})")
    } else {
        format!("ActivityScheduled({activity_type})")
    }
}

#[async_trait]
impl ActivityInvoker for WorkflowContext {
    async fn execute_activity(&mut self, call: ActivityCall) -> Result<ActivityOutcome> {
        self.schedule(call, false).await
    }

    async fn execute_compensation(&mut self, call: ActivityCall) -> Result<ActivityOutcome> {
        self.schedule(call, true).await
    }

    async fn begin_compensation(&mut self, failure: StepFailure) -> Result<()> {
        let mut log = self.log.lock().await;
        if log.compensation_started() {
            return Ok(());
        }
        log.append(self.store.as_ref(), HistoryEvent::compensation_started(failure))
            .await?;
        Ok(())
    }

    async fn cancel_requested(&mut self) -> Result<Option<String>> {
        let log = self.log.lock().await;
        Ok(log
            .cancel_request()
            .filter(|(version, _)| *version <= self.observed)
            .map(|(_, reason)| reason.to_string()))
    }
}
