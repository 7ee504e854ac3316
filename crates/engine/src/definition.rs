//! Workflow definitions and the capability they drive activities through.

use activity::{ActivityOptions, ActivityOutcome};
use async_trait::async_trait;

use crate::context::WorkflowContext;
use crate::error::Result;
use crate::history::StepFailure;

/// How a workflow run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowResult {
    Completed(serde_json::Value),
    Failed(String),
}

/// A deterministic workflow.
///
/// `run` may be executed many times for one execution: once live and again
/// after every restart. It must derive every decision from `input` and from
/// values returned by `ctx`, never from clocks, randomness or shared state.
#[async_trait]
pub trait WorkflowDefinition: Send + Sync {
    /// Registered name, also stored in `WorkflowStarted`.
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut WorkflowContext, input: serde_json::Value)
    -> Result<WorkflowResult>;
}

/// One activity invocation requested by a workflow.
#[derive(Debug, Clone)]
pub struct ActivityCall {
    pub step: usize,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

impl ActivityCall {
    pub fn new(
        step: usize,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self {
            step,
            activity_type: activity_type.into(),
            input,
            options,
        }
    }
}

/// The side-effect capability a saga coordinator depends on.
///
/// [`WorkflowContext`] is the durable implementation; tests can script
/// outcomes without an engine.
#[async_trait]
pub trait ActivityInvoker: Send {
    /// Runs a forward activity to its terminal outcome.
    async fn execute_activity(&mut self, call: ActivityCall) -> Result<ActivityOutcome>;

    /// Runs a compensating activity to its terminal outcome.
    async fn execute_compensation(&mut self, call: ActivityCall) -> Result<ActivityOutcome>;

    /// Records the switch to the compensation phase.
    async fn begin_compensation(&mut self, failure: StepFailure) -> Result<()>;

    /// Returns the cancellation reason once the execution has observed one.
    async fn cancel_requested(&mut self) -> Result<Option<String>>;
}
