use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    EventEnvelope, EventStoreError, ExecutionId, Result, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

/// In-memory history store.
///
/// Clones share the same underlying histories, so a second engine built
/// on a clone observes everything the first one wrote. Tests rely on this
/// to simulate a process restart.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    histories: Arc<RwLock<HashMap<ExecutionId, Vec<EventEnvelope>>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored across all executions.
    pub async fn event_count(&self) -> usize {
        self.histories.read().await.values().map(Vec::len).sum()
    }

    /// Drops every event written after `version` for one execution.
    ///
    /// Only meant for crash-simulation in tests: it models a process that
    /// died before the later appends became durable.
    pub async fn truncate_after(&self, execution_id: &ExecutionId, version: Version) {
        if let Some(history) = self.histories.write().await.get_mut(execution_id) {
            history.retain(|e| e.version <= version);
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let execution_id = events[0].execution_id.clone();
        let first_new_version = events[0].version;

        let mut histories = self.histories.write().await;
        let history = histories.entry(execution_id.clone()).or_default();

        let current_version = history
            .last()
            .map(|e| e.version)
            .unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                execution_id,
                expected,
                actual: current_version,
            });
        }

        // Unique (execution_id, version) constraint.
        if first_new_version != current_version.next() {
            return Err(EventStoreError::ConcurrencyConflict {
                execution_id,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(current_version);
        history.extend(events);

        Ok(last_version)
    }

    async fn get_events(&self, execution_id: &ExecutionId) -> Result<Vec<EventEnvelope>> {
        let histories = self.histories.read().await;
        Ok(histories.get(execution_id).cloned().unwrap_or_default())
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let histories = self.histories.read().await;
        let mut events: Vec<_> = histories
            .values()
            .flatten()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        Ok(events)
    }

    async fn get_version(&self, execution_id: &ExecutionId) -> Result<Option<Version>> {
        let histories = self.histories.read().await;
        Ok(histories
            .get(execution_id)
            .and_then(|h| h.last())
            .map(|e| e.version))
    }
}
