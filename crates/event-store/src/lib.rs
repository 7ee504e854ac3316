//! Durable, append-only storage for workflow execution histories.
//!
//! Each execution owns one stream of versioned events. Appends are
//! guarded by optimistic concurrency on the expected stream version,
//! which is what keeps a single writer per execution honest.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::ExecutionId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{AppendOptions, EventStore, EventStoreExt};
