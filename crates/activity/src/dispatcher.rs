//! Activity dispatcher: scheduling, attempt tracking, timeouts and retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::TaskId;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ActivityError, DispatchError};
use crate::queue::TaskQueueRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::task::{ActivityOutcome, ActivityTask, TaskHandle};

struct Outstanding {
    task: ActivityTask,
    policy: RetryPolicy,
    /// Whether the current attempt has been picked up by a worker.
    started: bool,
    reply: oneshot::Sender<ActivityOutcome>,
    /// Set for durable schedules: retries wait for an acknowledgement.
    retries: Option<mpsc::UnboundedSender<RetryScheduled>>,
}

struct DispatcherInner {
    queues: TaskQueueRegistry,
    outstanding: Mutex<HashMap<TaskId, Outstanding>>,
}

/// Places activity tasks on queues and resolves them to a terminal outcome.
///
/// Each scheduled task stays outstanding until it completes or the retry
/// policy is exhausted. Workers report per attempt through [`complete`] and
/// [`fail`]; reports for an attempt that is no longer current are rejected
/// with [`DispatchError::StaleAttempt`].
///
/// [`complete`]: ActivityDispatcher::complete
/// [`fail`]: ActivityDispatcher::fail
#[derive(Clone)]
pub struct ActivityDispatcher {
    inner: Arc<DispatcherInner>,
}

/// A failed attempt whose retry waits until the listener has recorded it.
///
/// Dropping it without [`acknowledge`](Self::acknowledge) abandons the task.
#[derive(Debug)]
pub struct RetryScheduled {
    /// The attempt that failed.
    pub attempt: u32,
    pub error: ActivityError,
    /// Backoff before attempt `attempt + 1` is enqueued.
    pub delay: Duration,
    recorded: oneshot::Sender<()>,
}

impl RetryScheduled {
    /// Releases the next attempt.
    pub fn acknowledge(self) {
        let _ = self.recorded.send(());
    }
}

/// What a scheduled task reports to the party waiting on it.
#[derive(Debug)]
pub enum ActivityEvent {
    Retry(RetryScheduled),
    Resolved(ActivityOutcome),
}

/// A scheduled task together with the receiver of its terminal outcome.
pub struct ScheduledActivity {
    pub handle: TaskHandle,
    outcome: oneshot::Receiver<ActivityOutcome>,
    retries: Option<mpsc::UnboundedReceiver<RetryScheduled>>,
}

impl ScheduledActivity {
    /// Waits for the terminal outcome. Suspends without holding a thread.
    ///
    /// Pending retry reports are released unrecorded.
    pub async fn outcome(self) -> Result<ActivityOutcome, DispatchError> {
        let ScheduledActivity {
            handle, outcome, ..
        } = self;
        outcome.await.map_err(|_| DispatchError::Closed(handle.task_id))
    }

    /// Waits for the next retry report or the terminal outcome, whichever
    /// the dispatcher produces first.
    pub async fn next_event(&mut self) -> Result<ActivityEvent, DispatchError> {
        let task_id = self.handle.task_id;
        if let Some(retries) = self.retries.as_mut() {
            tokio::select! {
                biased;
                Some(retry) = retries.recv() => return Ok(ActivityEvent::Retry(retry)),
                outcome = &mut self.outcome => {
                    return outcome
                        .map(ActivityEvent::Resolved)
                        .map_err(|_| DispatchError::Closed(task_id));
                }
            }
        }
        (&mut self.outcome)
            .await
            .map(ActivityEvent::Resolved)
            .map_err(|_| DispatchError::Closed(task_id))
    }
}

impl Default for ActivityDispatcher {
    fn default() -> Self {
        Self::new(TaskQueueRegistry::new())
    }
}

impl ActivityDispatcher {
    pub fn new(queues: TaskQueueRegistry) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                queues,
                outstanding: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn queues(&self) -> &TaskQueueRegistry {
        &self.inner.queues
    }

    /// Number of tasks still waiting for a terminal outcome.
    pub fn outstanding_count(&self) -> usize {
        self.inner.outstanding.lock().len()
    }

    /// Enqueues `task` on its task queue right away.
    pub fn schedule(&self, task: ActivityTask, policy: RetryPolicy) -> ScheduledActivity {
        self.enqueue(task, policy, Duration::ZERO, false)
    }

    /// Enqueues `task` once `delay` has passed, reporting every retry.
    ///
    /// Each retryable failure is surfaced through
    /// [`ScheduledActivity::next_event`] and the next attempt is held until
    /// the report is acknowledged. The task keeps its `attempt`, so a
    /// resumed task spends only what is left of the attempt budget.
    pub fn schedule_durable(
        &self,
        task: ActivityTask,
        policy: RetryPolicy,
        delay: Duration,
    ) -> ScheduledActivity {
        self.enqueue(task, policy, delay, true)
    }

    #[tracing::instrument(skip(self, task, policy), fields(
        execution_id = %task.execution_id,
        activity_type = %task.activity_type,
        task_queue = %task.task_queue,
        attempt = task.attempt,
    ))]
    fn enqueue(
        &self,
        task: ActivityTask,
        policy: RetryPolicy,
        delay: Duration,
        report_retries: bool,
    ) -> ScheduledActivity {
        let (reply, outcome) = oneshot::channel();
        let (retries_tx, retries) = if report_retries {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let handle = task.handle();
        let queue = self.inner.queues.get_or_create(&task.task_queue);

        self.inner.outstanding.lock().insert(
            task.task_id,
            Outstanding {
                task: task.clone(),
                policy,
                started: false,
                reply,
                retries: retries_tx,
            },
        );
        if delay.is_zero() {
            queue.push(task);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.push(task);
            });
        }

        metrics::counter!("activity_dispatched_total").increment(1);
        tracing::debug!(task_id = %handle.task_id, delay_ms = delay.as_millis() as u64, "activity scheduled");

        ScheduledActivity {
            handle,
            outcome,
            retries,
        }
    }

    /// Waits for the next task on `queue_name` and marks its attempt started.
    ///
    /// Arms the start-to-close timer for the attempt. Returns None when the
    /// queue is closed.
    pub async fn poll(&self, queue_name: &str) -> Option<ActivityTask> {
        let queue = self.inner.queues.get_or_create(queue_name);
        loop {
            let task = queue.poll().await?;

            let is_current = {
                let mut outstanding = self.inner.outstanding.lock();
                match outstanding.get_mut(&task.task_id) {
                    Some(entry) if entry.task.attempt == task.attempt && !entry.started => {
                        entry.started = true;
                        true
                    }
                    _ => false,
                }
            };

            if !is_current {
                tracing::debug!(task_id = %task.task_id, attempt = task.attempt, "dropping superseded delivery");
                continue;
            }

            self.arm_timeout(&task);
            return Some(task);
        }
    }

    /// Records a successful attempt as the task's terminal outcome.
    pub fn complete(
        &self,
        handle: TaskHandle,
        output: serde_json::Value,
    ) -> Result<(), DispatchError> {
        let entry = {
            let mut outstanding = self.inner.outstanding.lock();
            Self::check_current(&outstanding, handle)?;
            outstanding
                .remove(&handle.task_id)
                .ok_or(DispatchError::UnknownTask(handle.task_id))?
        };

        tracing::info!(
            execution_id = %entry.task.execution_id,
            activity_type = %entry.task.activity_type,
            attempt = handle.attempt,
            "activity completed"
        );
        // The waiting execution may have been shut down; nothing to deliver then.
        let _ = entry.reply.send(ActivityOutcome::Completed {
            output,
            attempts: handle.attempt,
        });
        Ok(())
    }

    /// Records a failed attempt and applies the task's retry policy.
    ///
    /// Retryable failures are re-enqueued as a new attempt after the backoff
    /// delay; exhausted or non-retryable failures resolve the task. When the
    /// scheduler listens for retries, the next attempt is also held until it
    /// acknowledges the [`RetryScheduled`] report.
    pub fn fail(&self, handle: TaskHandle, error: ActivityError) -> Result<(), DispatchError> {
        let mut outstanding = self.inner.outstanding.lock();
        Self::check_current(&outstanding, handle)?;

        let entry = outstanding
            .get_mut(&handle.task_id)
            .ok_or(DispatchError::UnknownTask(handle.task_id))?;

        match entry.policy.evaluate(handle.attempt, &error) {
            RetryDecision::RetryAfter(delay) => {
                entry.task.attempt += 1;
                entry.started = false;
                let next = entry.task.clone();

                let (recorded_tx, recorded_rx) = oneshot::channel();
                let report = RetryScheduled {
                    attempt: handle.attempt,
                    error: error.clone(),
                    delay,
                    recorded: recorded_tx,
                };
                let gate = entry
                    .retries
                    .as_ref()
                    .is_some_and(|retries| retries.send(report).is_ok())
                    .then_some(recorded_rx);
                drop(outstanding);

                metrics::counter!("activity_retries_total").increment(1);
                tracing::warn!(
                    execution_id = %next.execution_id,
                    activity_type = %next.activity_type,
                    failed_attempt = handle.attempt,
                    next_attempt = next.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "activity attempt failed, retrying"
                );

                let dispatcher = self.clone();
                let queue = self.inner.queues.get_or_create(&next.task_queue);
                tokio::spawn(async move {
                    let recorded = async move {
                        match gate {
                            Some(recorded) => recorded.await.is_ok(),
                            None => true,
                        }
                    };
                    let ((), recorded) = tokio::join!(tokio::time::sleep(delay), recorded);
                    if recorded {
                        queue.push(next);
                    } else {
                        dispatcher.abandon(next.task_id);
                    }
                });
            }
            RetryDecision::Exhausted => {
                let Some(entry) = outstanding.remove(&handle.task_id) else {
                    return Err(DispatchError::UnknownTask(handle.task_id));
                };
                drop(outstanding);

                metrics::counter!("activity_exhausted_total").increment(1);
                tracing::warn!(
                    execution_id = %entry.task.execution_id,
                    activity_type = %entry.task.activity_type,
                    attempts = handle.attempt,
                    error = %error,
                    "activity failed terminally"
                );
                let _ = entry.reply.send(ActivityOutcome::Failed {
                    error,
                    attempts: handle.attempt,
                });
            }
        }

        Ok(())
    }

    /// Drops a task whose retry was never recorded; its scheduler is gone.
    fn abandon(&self, task_id: TaskId) {
        if self.inner.outstanding.lock().remove(&task_id).is_some() {
            tracing::debug!(%task_id, "retry not recorded, task abandoned");
        }
    }

    /// Closes every queue so that polling workers stop.
    pub fn close(&self) {
        self.inner.queues.close_all();
    }

    fn check_current(
        outstanding: &HashMap<TaskId, Outstanding>,
        handle: TaskHandle,
    ) -> Result<(), DispatchError> {
        let entry = outstanding
            .get(&handle.task_id)
            .ok_or(DispatchError::UnknownTask(handle.task_id))?;
        if entry.task.attempt != handle.attempt {
            return Err(DispatchError::StaleAttempt {
                task_id: handle.task_id,
                attempt: handle.attempt,
                current: entry.task.attempt,
            });
        }
        Ok(())
    }

    fn arm_timeout(&self, task: &ActivityTask) {
        let dispatcher = self.clone();
        let handle = task.handle();
        let timeout = task.start_to_close_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let error = ActivityError::timeout(format!(
                "no completion report within {}ms",
                timeout.as_millis()
            ));
            // Already resolved or superseded attempts reject the report; that is the normal case.
            if dispatcher.fail(handle, error).is_ok() {
                metrics::counter!("activity_timeouts_total").increment(1);
                tracing::warn!(task_id = %handle.task_id, attempt = handle.attempt, "activity attempt timed out");
            }
        });
    }
}
