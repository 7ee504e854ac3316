//! Activity workers with explicit start and graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dispatcher::ActivityDispatcher;
use crate::error::ActivityError;
use crate::task::ActivityTask;

/// Implementation of one activity type.
///
/// Handlers run under at-least-once delivery and must be idempotent;
/// `task.idempotency_key` is stable across redeliveries.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn execute(&self, task: &ActivityTask) -> Result<serde_json::Value, ActivityError>;
}

/// A worker bound to one task queue and a map of activity handlers.
///
/// Nothing runs until [`Worker::start`] is called.
pub struct Worker {
    task_queue: String,
    dispatcher: ActivityDispatcher,
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
    max_concurrency: usize,
}

impl Worker {
    pub fn new(task_queue: impl Into<String>, dispatcher: ActivityDispatcher) -> Self {
        Self {
            task_queue: task_queue.into(),
            dispatcher,
            handlers: HashMap::new(),
            max_concurrency: 4,
        }
    }

    pub fn register(
        mut self,
        activity_type: impl Into<String>,
        handler: Arc<dyn ActivityHandler>,
    ) -> Self {
        self.handlers.insert(activity_type.into(), handler);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Starts polling. The returned handle stops the worker.
    pub fn start(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracing::info!(
            task_queue = %self.task_queue,
            activities = ?self.handlers.keys().collect::<Vec<_>>(),
            "worker started"
        );

        let task_queue = self.task_queue.clone();
        let poll_loop = tokio::spawn(run_poll_loop(self, cancel.clone(), tracker.clone()));

        WorkerHandle {
            task_queue,
            cancel,
            tracker,
            poll_loop,
        }
    }
}

async fn run_poll_loop(worker: Worker, cancel: CancellationToken, tracker: TaskTracker) {
    let Worker {
        task_queue,
        dispatcher,
        handlers,
        max_concurrency,
    } = worker;
    let permits = Arc::new(Semaphore::new(max_concurrency));

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = dispatcher.poll(&task_queue) => match task {
                Some(task) => task,
                None => break,
            },
        };

        let handler = handlers.get(&task.activity_type).cloned();
        let dispatcher = dispatcher.clone();
        tracker.spawn(async move {
            let _permit = permit;
            execute_task(&dispatcher, handler, task).await;
        });
    }

    tracing::info!(task_queue = %task_queue, "worker stopped polling");
}

async fn execute_task(
    dispatcher: &ActivityDispatcher,
    handler: Option<Arc<dyn ActivityHandler>>,
    task: ActivityTask,
) {
    let handle = task.handle();
    let result = match handler {
        Some(handler) => handler.execute(&task).await,
        None => Err(ActivityError::non_retryable(format!(
            "no handler registered for activity type '{}' on queue '{}'",
            task.activity_type, task.task_queue
        ))),
    };

    let report = match result {
        Ok(output) => dispatcher.complete(handle, output),
        Err(error) => dispatcher.fail(handle, error),
    };

    if let Err(e) = report {
        tracing::warn!(
            execution_id = %task.execution_id,
            activity_type = %task.activity_type,
            attempt = task.attempt,
            error = %e,
            "activity report rejected"
        );
    }
}

/// Control handle for a running worker.
pub struct WorkerHandle {
    task_queue: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    poll_loop: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Number of activity attempts currently executing.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stops polling and waits up to `grace` for in-flight attempts to finish.
    ///
    /// Returns true when everything drained in time. Attempts still running
    /// after the grace period are left to their start-to-close timeout.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        if let Err(e) = self.poll_loop.await {
            tracing::error!(task_queue = %self.task_queue, error = %e, "worker poll loop panicked");
        }

        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();

        if drained {
            tracing::info!(task_queue = %self.task_queue, "worker drained");
        } else {
            tracing::warn!(
                task_queue = %self.task_queue,
                in_flight = self.tracker.len(),
                "worker shutdown grace period elapsed"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use common::ExecutionId;

    use super::*;
    use crate::error::FailureKind;
    use crate::retry::RetryPolicy;
    use crate::task::{ActivityOptions, ActivityOutcome};

    struct Echo;

    #[async_trait]
    impl ActivityHandler for Echo {
        async fn execute(&self, task: &ActivityTask) -> Result<serde_json::Value, ActivityError> {
            Ok(task.input.clone())
        }
    }

    /// Fails with a retryable error the first `failures` times.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActivityHandler for Flaky {
        async fn execute(&self, _task: &ActivityTask) -> Result<serde_json::Value, ActivityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(ActivityError::retryable(format!("transient failure {call}")))
            } else {
                Ok(serde_json::json!(call))
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl ActivityHandler for Slow {
        async fn execute(&self, _task: &ActivityTask) -> Result<serde_json::Value, ActivityError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(serde_json::json!("done"))
        }
    }

    fn task(activity_type: &str, opts: &ActivityOptions) -> ActivityTask {
        ActivityTask::new(
            ExecutionId::new("exec-1"),
            activity_type,
            serde_json::json!({"n": 1}),
            opts,
            "exec-1/1",
        )
    }

    #[tokio::test]
    async fn worker_executes_registered_handler() {
        let dispatcher = ActivityDispatcher::default();
        let handle = Worker::new("Q", dispatcher.clone())
            .register("echo", Arc::new(Echo))
            .start();

        let opts = ActivityOptions::new("Q");
        let scheduled = dispatcher.schedule(task("echo", &opts), RetryPolicy::default());

        let outcome = scheduled.outcome().await.unwrap();
        assert_eq!(
            outcome,
            ActivityOutcome::Completed {
                output: serde_json::json!({"n": 1}),
                attempts: 1
            }
        );
        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_retries_transient_failures() {
        let dispatcher = ActivityDispatcher::default();
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let handle = Worker::new("Q", dispatcher.clone())
            .register("flaky", flaky.clone())
            .start();

        let opts = ActivityOptions::new("Q").with_retry_policy(RetryPolicy::new(3));
        let scheduled = dispatcher.schedule(task("flaky", &opts), opts.retry_policy.clone());

        let outcome = scheduled.outcome().await.unwrap();
        assert_eq!(outcome.attempts(), 3);
        assert!(outcome.is_completed());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unknown_activity_type_fails_without_retry() {
        let dispatcher = ActivityDispatcher::default();
        let handle = Worker::new("Q", dispatcher.clone())
            .register("echo", Arc::new(Echo))
            .start();

        let opts = ActivityOptions::new("Q");
        let scheduled = dispatcher.schedule(task("missing", &opts), RetryPolicy::default());

        match scheduled.outcome().await.unwrap() {
            ActivityOutcome::Failed { error, attempts } => {
                assert_eq!(error.kind, FailureKind::NonRetryable);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_tasks() {
        let dispatcher = ActivityDispatcher::default();
        let handle = Worker::new("Q", dispatcher.clone())
            .register("slow", Arc::new(Slow))
            .start();

        let opts = ActivityOptions::new("Q");
        let scheduled = dispatcher.schedule(task("slow", &opts), RetryPolicy::default());

        // Let the worker pick the task up before shutting down.
        while handle.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(handle.shutdown(Duration::from_secs(5)).await);

        let outcome = scheduled.outcome().await.unwrap();
        assert!(outcome.is_completed());
    }
}
