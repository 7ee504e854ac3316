//! Execution lifecycle: start, status, cancel, recover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use activity::ActivityDispatcher;
use common::ExecutionId;
use event_store::{EventStore, EventStoreError, EventStoreExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::context::WorkflowContext;
use crate::definition::{WorkflowDefinition, WorkflowResult};
use crate::error::{EngineError, Result};
use crate::execution::{ExecutionReport, WorkflowExecution};
use crate::history::HistoryEvent;
use crate::log::{ExecutionLog, SharedLog, decode};

struct ActiveExecution {
    log: SharedLog,
    abort: Option<AbortHandle>,
}

struct EngineInner {
    store: Arc<dyn EventStore>,
    dispatcher: ActivityDispatcher,
    definitions: RwLock<HashMap<String, Arc<dyn WorkflowDefinition>>>,
    active: Mutex<HashMap<ExecutionId, ActiveExecution>>,
}

/// Runs workflow executions against a durable history.
///
/// Each active execution is driven by exactly one task. Executions are
/// independent of each other and run in parallel.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

/// Handle to a started execution.
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    done: watch::Receiver<bool>,
    engine: WorkflowEngine,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Waits until the driving task stops and returns the execution report.
    ///
    /// The report is non-terminal if the engine was shut down first.
    pub async fn wait(mut self) -> Result<ExecutionReport> {
        // Err means the task was aborted without signalling.
        let _ = self.done.wait_for(|done| *done).await;
        self.engine.status(&self.execution_id).await
    }
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn EventStore>, dispatcher: ActivityDispatcher) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                dispatcher,
                definitions: RwLock::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register(&self, definition: Arc<dyn WorkflowDefinition>) {
        let name = definition.name().to_string();
        tracing::debug!(definition = %name, "workflow definition registered");
        self.inner.definitions.write().insert(name, definition);
    }

    pub fn dispatcher(&self) -> &ActivityDispatcher {
        &self.inner.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    /// Number of executions with a driving task in this process.
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn is_active(&self, execution_id: &ExecutionId) -> bool {
        self.inner.active.lock().contains_key(execution_id)
    }

    /// Starts a new execution of `definition`.
    ///
    /// Fails with `AlreadyRunning` while an execution with this id is active
    /// and with `AlreadyExists` once it has finished.
    #[tracing::instrument(skip(self, execution_id, input), fields(execution_id = %execution_id))]
    pub async fn start(
        &self,
        execution_id: ExecutionId,
        definition: &str,
        input: serde_json::Value,
    ) -> Result<ExecutionHandle> {
        let definition = self.definition(definition)?;
        let log = ExecutionLog::new(execution_id.clone(), definition.name()).shared();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut active = self.inner.active.lock();
            if active.contains_key(&execution_id) {
                return Err(EngineError::AlreadyRunning(execution_id));
            }
            active.insert(
                execution_id.clone(),
                ActiveExecution {
                    log: log.clone(),
                    abort: None,
                },
            );
        }

        let started = log
            .lock()
            .await
            .append(
                self.inner.store.as_ref(),
                HistoryEvent::workflow_started(definition.name(), input.clone()),
            )
            .await;

        if let Err(e) = started {
            self.inner.active.lock().remove(&execution_id);
            return Err(match e {
                EngineError::EventStore(EventStoreError::ConcurrencyConflict { .. }) => {
                    self.classify_existing(&execution_id).await
                }
                other => other,
            });
        }

        metrics::counter!("workflow_started_total").increment(1);
        tracing::info!(definition = definition.name(), "workflow started");

        self.spawn(execution_id.clone(), definition, input, log, done_tx);
        Ok(ExecutionHandle {
            execution_id,
            done: done_rx,
            engine: self.clone(),
        })
    }

    /// Returns the report folded from the execution's history.
    pub async fn status(&self, execution_id: &ExecutionId) -> Result<ExecutionReport> {
        let history = self.history(execution_id).await?;
        Ok(WorkflowExecution::from_history(execution_id.clone(), &history).report())
    }

    /// Returns the raw history, oldest first.
    pub async fn history(&self, execution_id: &ExecutionId) -> Result<Vec<HistoryEvent>> {
        let envelopes = self.inner.store.get_events(execution_id).await?;
        if envelopes.is_empty() {
            return Err(EngineError::NotFound(execution_id.clone()));
        }
        envelopes.iter().map(decode).collect()
    }

    /// Records a cancellation request.
    ///
    /// The running workflow observes it at its next resumption point; an
    /// in-flight activity attempt is not interrupted.
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel(&self, execution_id: &ExecutionId, reason: impl Into<String>) -> Result<()> {
        let log = self
            .inner
            .active
            .lock()
            .get(execution_id)
            .map(|active| active.log.clone());

        let Some(log) = log else {
            return Err(if self.inner.store.history_exists(execution_id).await? {
                EngineError::NotActive(execution_id.clone())
            } else {
                EngineError::NotFound(execution_id.clone())
            });
        };

        let mut log = log.lock().await;
        if log.is_terminal() {
            return Err(EngineError::NotActive(execution_id.clone()));
        }
        if log.cancel_request().is_some() {
            return Ok(());
        }

        let reason = reason.into();
        log.append(
            self.inner.store.as_ref(),
            HistoryEvent::cancel_requested(reason.clone()),
        )
        .await?;
        tracing::info!(reason = %reason, "cancellation requested");
        Ok(())
    }

    /// Resumes every non-terminal execution found in the store.
    ///
    /// Each one is re-run from the start against its history: recorded
    /// results are replayed and only unresolved scheduling points are
    /// dispatched again.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<ExecutionHandle>> {
        let started = self
            .inner
            .store
            .get_events_by_type("WorkflowStarted")
            .await?;
        let mut handles = Vec::new();

        for envelope in started {
            let execution_id = envelope.execution_id.clone();
            if self.is_active(&execution_id) {
                continue;
            }

            let envelopes = self.inner.store.get_events(&execution_id).await?;
            let log = match ExecutionLog::from_envelopes(
                execution_id.clone(),
                envelope.workflow_type.clone(),
                &envelopes,
            ) {
                Ok(log) => log,
                Err(e) => {
                    tracing::error!(execution_id = %execution_id, error = %e, "skipping unreadable history");
                    continue;
                }
            };
            if log.is_terminal() {
                continue;
            }

            let execution = WorkflowExecution::from_history(
                execution_id.clone(),
                log.events().iter().map(|r| &r.event),
            );
            let definition = match self.definition(execution.definition()) {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "cannot resume execution");
                    continue;
                }
            };

            let log = log.shared();
            let (done_tx, done_rx) = watch::channel(false);
            {
                let mut active = self.inner.active.lock();
                if active.contains_key(&execution_id) {
                    continue;
                }
                active.insert(
                    execution_id.clone(),
                    ActiveExecution {
                        log: log.clone(),
                        abort: None,
                    },
                );
            }

            metrics::counter!("workflow_replayed_total").increment(1);
            tracing::info!(
                execution_id = %execution_id,
                history_length = envelopes.len(),
                status = %execution.status(),
                "resuming execution from history"
            );

            self.spawn(
                execution_id.clone(),
                definition,
                execution.input().clone(),
                log,
                done_tx,
            );
            handles.push(ExecutionHandle {
                execution_id,
                done: done_rx,
                engine: self.clone(),
            });
        }

        Ok(handles)
    }

    /// Stops driving every active execution without touching history.
    ///
    /// Histories stay non-terminal and are picked up by `recover`.
    pub fn shutdown(&self) {
        let active: Vec<_> = self.inner.active.lock().drain().collect();
        for (execution_id, execution) in active {
            if let Some(abort) = execution.abort {
                abort.abort();
            }
            tracing::debug!(execution_id = %execution_id, "execution detached");
        }
    }

    fn definition(&self, name: &str) -> Result<Arc<dyn WorkflowDefinition>> {
        self.inner
            .definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(name.to_string()))
    }

    async fn classify_existing(&self, execution_id: &ExecutionId) -> EngineError {
        match self.status(execution_id).await {
            Ok(report) if report.status.is_terminal() => {
                EngineError::AlreadyExists(execution_id.clone())
            }
            Ok(_) => EngineError::AlreadyRunning(execution_id.clone()),
            Err(e) => e,
        }
    }

    fn spawn(
        &self,
        execution_id: ExecutionId,
        definition: Arc<dyn WorkflowDefinition>,
        input: serde_json::Value,
        log: SharedLog,
        done: watch::Sender<bool>,
    ) {
        let engine = self.clone();
        let id = execution_id.clone();
        let task = tokio::spawn(async move {
            engine.drive(id, definition, input, log, done).await;
        });

        if let Some(active) = self.inner.active.lock().get_mut(&execution_id) {
            active.abort = Some(task.abort_handle());
        }
    }

    async fn drive(
        self,
        execution_id: ExecutionId,
        definition: Arc<dyn WorkflowDefinition>,
        input: serde_json::Value,
        log: SharedLog,
        done: watch::Sender<bool>,
    ) {
        let started_at = Instant::now();
        let mut ctx = WorkflowContext::new(
            execution_id.clone(),
            log.clone(),
            self.inner.store.clone(),
            self.inner.dispatcher.clone(),
        );

        let terminal = match definition.run(&mut ctx, input).await {
            Ok(WorkflowResult::Completed(output)) => Some(HistoryEvent::workflow_completed(output)),
            Ok(WorkflowResult::Failed(reason)) => Some(HistoryEvent::workflow_failed(reason)),
            Err(e) if e.is_infrastructure() => {
                tracing::error!(
                    execution_id = %execution_id,
                    error = %e,
                    "execution suspended, history left open for recovery"
                );
                None
            }
            Err(e) => {
                tracing::error!(execution_id = %execution_id, error = %e, "workflow errored");
                Some(HistoryEvent::workflow_failed(e.to_string()))
            }
        };

        if let Some(event) = terminal {
            let completed = matches!(event, HistoryEvent::WorkflowCompleted(_));
            let appended = log
                .lock()
                .await
                .append(self.inner.store.as_ref(), event)
                .await;

            match appended {
                Ok(_) => {
                    if completed {
                        metrics::counter!("workflow_completed_total").increment(1);
                        tracing::info!(execution_id = %execution_id, "workflow completed");
                    } else {
                        metrics::counter!("workflow_failed_total").increment(1);
                        tracing::warn!(execution_id = %execution_id, "workflow failed");
                    }
                    metrics::histogram!("workflow_duration_seconds")
                        .record(started_at.elapsed().as_secs_f64());
                }
                Err(e) => {
                    tracing::error!(
                        execution_id = %execution_id,
                        error = %e,
                        "failed to record workflow result"
                    );
                }
            }
        }

        self.inner.active.lock().remove(&execution_id);
        let _ = done.send(true);
    }
}
