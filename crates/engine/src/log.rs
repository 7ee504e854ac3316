//! In-memory view of one execution's history, kept in step with the store.

use std::sync::Arc;

use common::ExecutionId;
use event_store::{AppendOptions, EventEnvelope, EventStore, Version};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::history::{ActivityScheduledData, AttemptFailedData, HistoryEvent, SideEffectData};

/// Shared by the running workflow and by `cancel`; the mutex serializes
/// every append for one execution.
pub(crate) type SharedLog = Arc<Mutex<ExecutionLog>>;

#[derive(Debug, Clone)]
pub(crate) struct RecordedEvent {
    pub version: Version,
    pub event: HistoryEvent,
}

#[derive(Debug)]
pub(crate) struct ExecutionLog {
    execution_id: ExecutionId,
    workflow_type: String,
    events: Vec<RecordedEvent>,
    version: Version,
}

/// Decodes a stored envelope into a history event.
pub fn decode(envelope: &EventEnvelope) -> Result<HistoryEvent> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        EngineError::InvalidHistory(format!(
            "{} v{} ({}): {}",
            envelope.execution_id, envelope.version, envelope.event_type, e
        ))
    })
}

impl ExecutionLog {
    pub fn new(execution_id: ExecutionId, workflow_type: impl Into<String>) -> Self {
        Self {
            execution_id,
            workflow_type: workflow_type.into(),
            events: Vec::new(),
            version: Version::initial(),
        }
    }

    /// Rebuilds the log from stored envelopes, oldest first.
    pub fn from_envelopes(
        execution_id: ExecutionId,
        workflow_type: impl Into<String>,
        envelopes: &[EventEnvelope],
    ) -> Result<Self> {
        let mut log = Self::new(execution_id, workflow_type);
        for envelope in envelopes {
            log.events.push(RecordedEvent {
                version: envelope.version,
                event: decode(envelope)?,
            });
            log.version = envelope.version;
        }
        Ok(log)
    }

    pub fn shared(self) -> SharedLog {
        Arc::new(Mutex::new(self))
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    /// Durably appends `event` as the next version, then records it locally.
    pub async fn append(&mut self, store: &dyn EventStore, event: HistoryEvent) -> Result<Version> {
        let version = self.version.next();
        let envelope = EventEnvelope::builder()
            .execution_id(self.execution_id.clone())
            .workflow_type(self.workflow_type.clone())
            .event_type(event.event_type())
            .version(version)
            .payload(&event)?
            .try_build()
            .ok_or_else(|| EngineError::InvalidHistory("incomplete event envelope".to_string()))?;

        store
            .append(vec![envelope], AppendOptions::expect_version(self.version))
            .await?;

        tracing::debug!(
            execution_id = %self.execution_id,
            version = %version,
            event_type = event.event_type(),
            "history event appended"
        );
        self.events.push(RecordedEvent { version, event });
        self.version = version;
        Ok(version)
    }

    /// The scheduling event for `seq`, with whether it was a compensation.
    pub fn scheduled(&self, seq: u64) -> Option<(bool, &ActivityScheduledData)> {
        self.events.iter().find_map(|r| match &r.event {
            HistoryEvent::ActivityScheduled(d) if d.seq == seq => Some((false, d)),
            HistoryEvent::CompensationScheduled(d) if d.seq == seq => Some((true, d)),
            _ => None,
        })
    }

    /// The terminal activity event recorded for `seq`, if any.
    pub fn result(&self, seq: u64) -> Option<&RecordedEvent> {
        self.events.iter().find(|r| {
            r.event.seq() == Some(seq)
                && matches!(
                    r.event,
                    HistoryEvent::ActivityCompleted(_)
                        | HistoryEvent::ActivityFailed(_)
                        | HistoryEvent::CompensationCompleted(_)
                        | HistoryEvent::CompensationFailed(_)
                )
        })
    }

    /// The latest recorded attempt failure for `seq`.
    pub fn last_failed_attempt(&self, seq: u64) -> Option<&AttemptFailedData> {
        self.events.iter().rev().find_map(|r| match &r.event {
            HistoryEvent::ActivityAttemptFailed(d) if d.seq == seq => Some(d),
            _ => None,
        })
    }

    pub fn side_effect(&self, seq: u64) -> Option<&SideEffectData> {
        self.events.iter().find_map(|r| match &r.event {
            HistoryEvent::SideEffectRecorded(d) if d.seq == seq => Some(d),
            _ => None,
        })
    }

    /// Event type of the first event recorded for decision `seq`.
    pub fn recorded_kind(&self, seq: u64) -> Option<&'static str> {
        self.events
            .iter()
            .find(|r| r.event.seq() == Some(seq))
            .map(|r| r.event.event_type())
    }

    pub fn compensation_started(&self) -> bool {
        self.events
            .iter()
            .any(|r| matches!(r.event, HistoryEvent::CompensationStarted(_)))
    }

    /// The earliest cancellation request, with its position in history.
    pub fn cancel_request(&self) -> Option<(Version, &str)> {
        self.events.iter().find_map(|r| match &r.event {
            HistoryEvent::CancelRequested(d) => Some((r.version, d.reason.as_str())),
            _ => None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.events.iter().any(|r| r.event.is_terminal())
    }
}
