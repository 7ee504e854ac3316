//! Engine integration tests: lifecycle, replay after restart, determinism.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use activity::{
    ActivityDispatcher, ActivityError, ActivityHandler, ActivityOptions, ActivityOutcome,
    ActivityTask, RetryPolicy, Worker, WorkerHandle,
};
use async_trait::async_trait;
use engine::{
    ActivityCall, ActivityInvoker, EngineError, ExecutionId, ExecutionStatus, HistoryEvent,
    WorkflowContext, WorkflowDefinition, WorkflowEngine, WorkflowResult,
};
use event_store::{EventStore, InMemoryEventStore, Version};

#[derive(Default)]
struct Counting {
    calls: AtomicU32,
}

impl Counting {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActivityHandler for Counting {
    async fn execute(&self, task: &ActivityTask) -> Result<serde_json::Value, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!(format!("{}-done", task.activity_type)))
    }
}

/// Fails every attempt with a retryable error.
#[derive(Default)]
struct AlwaysDown {
    calls: AtomicU32,
}

#[async_trait]
impl ActivityHandler for AlwaysDown {
    async fn execute(&self, _task: &ActivityTask) -> Result<serde_json::Value, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ActivityError::retryable("provider down"))
    }
}

/// Runs activity F with three attempts: 10ms before the second, 1s before
/// the third.
struct Retrying;

#[async_trait]
impl WorkflowDefinition for Retrying {
    fn name(&self) -> &str {
        "Retrying"
    }

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        input: serde_json::Value,
    ) -> engine::Result<WorkflowResult> {
        let options = ActivityOptions::new("F").with_retry_policy(
            RetryPolicy::new(3)
                .with_initial_interval(Duration::from_millis(10))
                .with_backoff_coefficient(100.0)
                .with_max_interval(Duration::from_secs(1)),
        );
        match ctx
            .execute_activity(ActivityCall::new(0, "F", input, options))
            .await?
        {
            ActivityOutcome::Completed { output, .. } => Ok(WorkflowResult::Completed(output)),
            ActivityOutcome::Failed { error, attempts } => Ok(WorkflowResult::Failed(format!(
                "F failed after {attempts} attempt(s): {error}"
            ))),
        }
    }
}

/// Runs activity A then activity B, checking for cancellation in between.
struct TwoStep;

#[async_trait]
impl WorkflowDefinition for TwoStep {
    fn name(&self) -> &str {
        "TwoStep"
    }

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        input: serde_json::Value,
    ) -> engine::Result<WorkflowResult> {
        let a = ctx
            .execute_activity(ActivityCall::new(0, "A", input, ActivityOptions::new("A")))
            .await?;
        let ActivityOutcome::Completed { output: a_out, .. } = a else {
            return Ok(WorkflowResult::Failed("A failed".to_string()));
        };

        if let Some(reason) = ctx.cancel_requested().await? {
            return Ok(WorkflowResult::Failed(format!("cancelled: {reason}")));
        }

        let b = ctx
            .execute_activity(ActivityCall::new(1, "B", a_out.clone(), ActivityOptions::new("B")))
            .await?;
        match b {
            ActivityOutcome::Completed { output, .. } => Ok(WorkflowResult::Completed(
                serde_json::json!({ "a": a_out, "b": output }),
            )),
            ActivityOutcome::Failed { error, .. } => Ok(WorkflowResult::Failed(error.to_string())),
        }
    }
}

/// Records a side effect, then runs activity B.
struct Stamped {
    produced: Arc<AtomicU32>,
}

#[async_trait]
impl WorkflowDefinition for Stamped {
    fn name(&self) -> &str {
        "Stamped"
    }

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        _input: serde_json::Value,
    ) -> engine::Result<WorkflowResult> {
        let produced = self.produced.clone();
        let stamp: u32 = ctx
            .side_effect(move || produced.fetch_add(1, Ordering::SeqCst) + 1)
            .await?;
        ctx.execute_activity(ActivityCall::new(
            0,
            "B",
            serde_json::json!(stamp),
            ActivityOptions::new("B"),
        ))
        .await?;
        Ok(WorkflowResult::Completed(serde_json::json!({ "stamp": stamp })))
    }
}

/// Picks its first activity from a flag; flipping the flag between runs
/// makes re-execution diverge from history.
struct Flipping {
    use_a: AtomicBool,
}

#[async_trait]
impl WorkflowDefinition for Flipping {
    fn name(&self) -> &str {
        "Flipping"
    }

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        input: serde_json::Value,
    ) -> engine::Result<WorkflowResult> {
        let (activity, queue) = if self.use_a.load(Ordering::SeqCst) {
            ("A", "A")
        } else {
            ("B", "B")
        };
        ctx.execute_activity(ActivityCall::new(0, activity, input, ActivityOptions::new(queue)))
            .await?;
        Ok(WorkflowResult::Completed(serde_json::json!(null)))
    }
}

fn worker(dispatcher: &ActivityDispatcher, queue: &str, handler: Arc<Counting>) -> WorkerHandle {
    Worker::new(queue, dispatcher.clone())
        .register(queue, handler)
        .start()
}

fn engine_on(store: &InMemoryEventStore, dispatcher: &ActivityDispatcher) -> WorkflowEngine {
    let engine = WorkflowEngine::new(Arc::new(store.clone()), dispatcher.clone());
    engine.register(Arc::new(TwoStep));
    engine
}

async fn wait_for_event(
    engine: &WorkflowEngine,
    id: &ExecutionId,
    predicate: impl Fn(&HistoryEvent) -> bool,
) {
    for _ in 0..500 {
        if let Ok(history) = engine.history(id).await
            && history.iter().any(&predicate)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("event never appeared in history of {id}");
}

fn event_types(history: &[HistoryEvent]) -> Vec<&'static str> {
    history.iter().map(HistoryEvent::event_type).collect()
}

#[tokio::test]
async fn execution_runs_to_completion() {
    let store = InMemoryEventStore::new();
    let dispatcher = ActivityDispatcher::default();
    let a = Arc::new(Counting::default());
    let b = Arc::new(Counting::default());
    let wa = worker(&dispatcher, "A", a.clone());
    let wb = worker(&dispatcher, "B", b.clone());

    let engine = engine_on(&store, &dispatcher);
    let id = ExecutionId::new("two-step-1");
    let report = engine
        .start(id.clone(), "TwoStep", serde_json::json!({"n": 1}))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.completed_steps, vec![0, 1]);
    assert_eq!(
        report.output,
        Some(serde_json::json!({"a": "A-done", "b": "B-done"}))
    );
    assert_eq!((a.calls(), b.calls()), (1, 1));

    let history = engine.history(&id).await.unwrap();
    assert_eq!(
        event_types(&history),
        [
            "WorkflowStarted",
            "ActivityScheduled",
            "ActivityCompleted",
            "ActivityScheduled",
            "ActivityCompleted",
            "WorkflowCompleted"
        ]
    );
    assert_eq!(engine.active_count(), 0);

    wa.shutdown(Duration::from_secs(1)).await;
    wb.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn duplicate_start_is_rejected() {
    let store = InMemoryEventStore::new();
    let dispatcher = ActivityDispatcher::default();
    let engine = engine_on(&store, &dispatcher);
    let id = ExecutionId::new("dup-1");

    // No workers yet, so the first execution stays blocked on A.
    let handle = engine
        .start(id.clone(), "TwoStep", serde_json::json!({}))
        .await
        .unwrap();
    let second = engine.start(id.clone(), "TwoStep", serde_json::json!({})).await;
    assert!(matches!(second, Err(EngineError::AlreadyRunning(_))));

    let wa = worker(&dispatcher, "A", Arc::new(Counting::default()));
    let wb = worker(&dispatcher, "B", Arc::new(Counting::default()));
    let report = handle.wait().await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);

    // Only one WorkflowStarted was ever recorded.
    let history = engine.history(&id).await.unwrap();
    assert_eq!(
        history
            .iter()
            .filter(|e| e.event_type() == "WorkflowStarted")
            .count(),
        1
    );

    let reused = engine.start(id, "TwoStep", serde_json::json!({})).await;
    assert!(matches!(reused, Err(EngineError::AlreadyExists(_))));

    wa.shutdown(Duration::from_secs(1)).await;
    wb.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unknown_definition_and_execution() {
    let store = InMemoryEventStore::new();
    let engine = engine_on(&store, &ActivityDispatcher::default());

    let result = engine
        .start(ExecutionId::new("x"), "Missing", serde_json::json!({}))
        .await;
    assert!(matches!(result, Err(EngineError::UnknownDefinition(_))));
    assert!(matches!(
        engine.status(&ExecutionId::new("x")).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.cancel(&ExecutionId::new("x"), "stop").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn recovery_redispatches_only_the_unresolved_activity() {
    let store = InMemoryEventStore::new();
    let a = Arc::new(Counting::default());
    let b = Arc::new(Counting::default());
    let id = ExecutionId::new("crash-1");

    // First process: only A has a worker, so the execution stalls on B.
    let d1 = ActivityDispatcher::default();
    let wa1 = worker(&d1, "A", a.clone());
    let engine1 = engine_on(&store, &d1);
    engine1
        .start(id.clone(), "TwoStep", serde_json::json!({}))
        .await
        .unwrap();
    wait_for_event(&engine1, &id, |e| {
        matches!(e, HistoryEvent::ActivityScheduled(d) if d.activity_type == "B")
    })
    .await;
    engine1.shutdown();
    wa1.shutdown(Duration::from_secs(1)).await;

    // Second process with both workers.
    let d2 = ActivityDispatcher::default();
    let wa2 = worker(&d2, "A", a.clone());
    let wb2 = worker(&d2, "B", b.clone());
    let engine2 = engine_on(&store, &d2);

    let handles = engine2.recover().await.unwrap();
    assert_eq!(handles.len(), 1);
    let report = handles.into_iter().next().unwrap().wait().await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(a.calls(), 1, "A must not be re-executed after restart");
    assert_eq!(b.calls(), 1);

    let history = engine2.history(&id).await.unwrap();
    let scheduled_b = history
        .iter()
        .filter(|e| matches!(e, HistoryEvent::ActivityScheduled(d) if d.activity_type == "B"))
        .count();
    assert_eq!(scheduled_b, 1, "re-dispatch must not duplicate the scheduling event");

    // Nothing left to recover.
    assert!(engine2.recover().await.unwrap().is_empty());

    wa2.shutdown(Duration::from_secs(1)).await;
    wb2.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn recovery_after_crash_before_next_schedule() {
    let store = InMemoryEventStore::new();
    let a = Arc::new(Counting::default());
    let b = Arc::new(Counting::default());
    let id = ExecutionId::new("crash-2");

    let d1 = ActivityDispatcher::default();
    let wa1 = worker(&d1, "A", a.clone());
    let engine1 = engine_on(&store, &d1);
    engine1
        .start(id.clone(), "TwoStep", serde_json::json!({}))
        .await
        .unwrap();
    wait_for_event(&engine1, &id, |e| matches!(e, HistoryEvent::ActivityCompleted(_))).await;
    engine1.shutdown();
    wa1.shutdown(Duration::from_secs(1)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Drop anything written after A's completion became durable.
    let completed_at = store
        .get_events(&id)
        .await
        .unwrap()
        .iter()
        .find(|e| e.event_type == "ActivityCompleted")
        .map(|e| e.version)
        .unwrap();
    assert_eq!(completed_at, Version::new(3));
    store.truncate_after(&id, completed_at).await;

    let d2 = ActivityDispatcher::default();
    let wa2 = worker(&d2, "A", a.clone());
    let wb2 = worker(&d2, "B", b.clone());
    let engine2 = engine_on(&store, &d2);
    let handles = engine2.recover().await.unwrap();
    let report = handles.into_iter().next().unwrap().wait().await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);

    wa2.shutdown(Duration::from_secs(1)).await;
    wb2.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn side_effects_are_not_regenerated_on_replay() {
    let store = InMemoryEventStore::new();
    let produced = Arc::new(AtomicU32::new(0));
    let definition = Arc::new(Stamped {
        produced: produced.clone(),
    });
    let id = ExecutionId::new("stamped-1");

    let d1 = ActivityDispatcher::default();
    let engine1 = WorkflowEngine::new(Arc::new(store.clone()), d1.clone());
    engine1.register(definition.clone());
    engine1
        .start(id.clone(), "Stamped", serde_json::json!({}))
        .await
        .unwrap();
    wait_for_event(&engine1, &id, |e| matches!(e, HistoryEvent::ActivityScheduled(_))).await;
    engine1.shutdown();

    let d2 = ActivityDispatcher::default();
    let wb = worker(&d2, "B", Arc::new(Counting::default()));
    let engine2 = WorkflowEngine::new(Arc::new(store.clone()), d2.clone());
    engine2.register(definition);
    let report = engine2
        .recover()
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.output, Some(serde_json::json!({"stamp": 1})));
    assert_eq!(produced.load(Ordering::SeqCst), 1);

    wb.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn diverging_replay_fails_the_execution() {
    let store = InMemoryEventStore::new();
    let definition = Arc::new(Flipping {
        use_a: AtomicBool::new(true),
    });
    let id = ExecutionId::new("flip-1");

    let engine1 = WorkflowEngine::new(Arc::new(store.clone()), ActivityDispatcher::default());
    engine1.register(definition.clone());
    engine1
        .start(id.clone(), "Flipping", serde_json::json!({}))
        .await
        .unwrap();
    wait_for_event(&engine1, &id, |e| matches!(e, HistoryEvent::ActivityScheduled(_))).await;
    engine1.shutdown();

    definition.use_a.store(false, Ordering::SeqCst);

    let engine2 = WorkflowEngine::new(Arc::new(store.clone()), ActivityDispatcher::default());
    engine2.register(definition);
    let report = engine2
        .recover()
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert!(report.reason.unwrap().contains("Non-deterministic"));
}

#[tokio::test]
async fn cancellation_is_observed_at_next_resumption() {
    let store = InMemoryEventStore::new();
    let dispatcher = ActivityDispatcher::default();
    let b = Arc::new(Counting::default());
    let engine = engine_on(&store, &dispatcher);
    let id = ExecutionId::new("cancel-1");

    let handle = engine
        .start(id.clone(), "TwoStep", serde_json::json!({}))
        .await
        .unwrap();
    engine.cancel(&id, "customer request").await.unwrap();
    // A second request is a no-op.
    engine.cancel(&id, "again").await.unwrap();

    // A still runs to completion; the request is seen after it returns.
    let wa = worker(&dispatcher, "A", Arc::new(Counting::default()));
    let wb = worker(&dispatcher, "B", b.clone());
    let report = handle.wait().await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.reason.as_deref(), Some("cancelled: customer request"));
    assert_eq!(report.cancel_requested.as_deref(), Some("customer request"));
    assert_eq!(report.completed_steps, vec![0]);
    assert_eq!(b.calls(), 0);

    assert!(matches!(
        engine.cancel(&id, "late").await,
        Err(EngineError::NotActive(_))
    ));

    wa.shutdown(Duration::from_secs(1)).await;
    wb.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn attempt_budget_survives_a_restart() {
    let store = InMemoryEventStore::new();
    let handler = Arc::new(AlwaysDown::default());
    let id = ExecutionId::new("retry-1");

    // First process: stop after the second attempt has been recorded, while
    // the third waits out its backoff.
    let d1 = ActivityDispatcher::default();
    let w1 = Worker::new("F", d1.clone()).register("F", handler.clone()).start();
    let engine1 = WorkflowEngine::new(Arc::new(store.clone()), d1.clone());
    engine1.register(Arc::new(Retrying));
    engine1
        .start(id.clone(), "Retrying", serde_json::json!({}))
        .await
        .unwrap();
    for _ in 0..500 {
        let history = engine1.history(&id).await.unwrap();
        if event_types(&history)
            .iter()
            .filter(|t| **t == "ActivityAttemptFailed")
            .count()
            == 2
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine1.shutdown();
    w1.shutdown(Duration::from_secs(1)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    let d2 = ActivityDispatcher::default();
    let w2 = Worker::new("F", d2.clone()).register("F", handler.clone()).start();
    let engine2 = WorkflowEngine::new(Arc::new(store.clone()), d2.clone());
    engine2.register(Arc::new(Retrying));
    let report = engine2
        .recover()
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(
        report.reason.as_deref(),
        Some("F failed after 3 attempt(s): Retryable: provider down")
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3, "only the third attempt may run");

    let history = engine2.history(&id).await.unwrap();
    let attempts: Vec<u32> = history
        .iter()
        .filter_map(|e| match e {
            HistoryEvent::ActivityAttemptFailed(d) => Some(d.attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);

    w2.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cancellation_recorded_before_a_crash_is_replayed() {
    let store = InMemoryEventStore::new();
    let a = Arc::new(Counting::default());
    let b = Arc::new(Counting::default());
    let id = ExecutionId::new("cancel-2");

    // First process has no workers: cancel while A is outstanding, then stop.
    let engine1 = engine_on(&store, &ActivityDispatcher::default());
    engine1
        .start(id.clone(), "TwoStep", serde_json::json!({}))
        .await
        .unwrap();
    wait_for_event(&engine1, &id, |e| matches!(e, HistoryEvent::ActivityScheduled(_))).await;
    engine1.cancel(&id, "customer request").await.unwrap();
    engine1.shutdown();

    let d2 = ActivityDispatcher::default();
    let wa = worker(&d2, "A", a.clone());
    let wb = worker(&d2, "B", b.clone());
    let engine2 = engine_on(&store, &d2);
    let report = engine2
        .recover()
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.reason.as_deref(), Some("cancelled: customer request"));
    assert_eq!(report.completed_steps, vec![0]);
    assert_eq!((a.calls(), b.calls()), (1, 0));

    let history = engine2.history(&id).await.unwrap();
    assert_eq!(
        history
            .iter()
            .filter(|e| e.event_type() == "CancelRequested")
            .count(),
        1
    );

    wa.shutdown(Duration::from_secs(1)).await;
    wb.shutdown(Duration::from_secs(1)).await;
}
