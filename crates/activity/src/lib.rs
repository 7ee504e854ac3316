//! Activity execution substrate.
//!
//! - [`RetryPolicy`] decides whether and when a failed attempt is retried.
//! - [`TaskQueue`] is a named channel between the dispatcher and workers.
//! - [`ActivityDispatcher`] places tasks on queues, tracks outstanding
//!   attempts, applies start-to-close timeouts and the retry policy.
//! - [`Worker`] polls one queue and runs registered [`ActivityHandler`]s.
//!
//! Delivery is at-least-once: a timed-out attempt is retried even if the
//! silent worker eventually finishes, so handlers must be idempotent.

pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod retry;
pub mod task;
pub mod worker;

pub use dispatcher::{ActivityDispatcher, ActivityEvent, RetryScheduled, ScheduledActivity};
pub use error::{ActivityError, DispatchError, FailureKind};
pub use queue::{TaskQueue, TaskQueueRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{ActivityOptions, ActivityOutcome, ActivityTask, TaskHandle};
pub use worker::{ActivityHandler, Worker, WorkerHandle};
