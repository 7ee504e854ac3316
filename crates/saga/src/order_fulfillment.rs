//! The order fulfillment saga: debit payment, then ship the order.
//!
//! | step | forward        | compensation    | queue                          |
//! |------|----------------|-----------------|--------------------------------|
//! | 0    | `debitPayment` | `refundPayment` | `PAYMENT_ACTIVITY_TASK_QUEUE`  |
//! | 1    | `shipOrder`    | none            | `SHIPPING_ACTIVITY_TASK_QUEUE` |
//!
//! Shipping is the last forward step and cannot be undone.

use std::time::Duration;

use activity::{ActivityOptions, RetryPolicy};
use common::ExecutionId;
use engine::{ExecutionHandle, WorkflowEngine};
use serde::{Deserialize, Serialize};

use crate::coordinator::SagaWorkflow;
use crate::definition::{ActivitySpec, SagaDefinition, Step};
use crate::error::{Result, SagaError};

/// The workflow type identifier for order fulfillment.
pub const WORKFLOW_TYPE: &str = "OrderFulfillment";

pub const DEBIT_PAYMENT: &str = "debitPayment";
pub const REFUND_PAYMENT: &str = "refundPayment";
pub const SHIP_ORDER: &str = "shipOrder";

pub const PAYMENT_ACTIVITY_TASK_QUEUE: &str = "PAYMENT_ACTIVITY_TASK_QUEUE";
pub const SHIPPING_ACTIVITY_TASK_QUEUE: &str = "SHIPPING_ACTIVITY_TASK_QUEUE";

/// Workflow input, also the input of `debitPayment` and `shipOrder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInput {
    pub order_id: i64,
    pub product_id: i64,
    pub price: f64,
    pub quantity: u32,
}

impl OrderInput {
    pub fn new(order_id: i64, product_id: i64, price: f64, quantity: u32) -> Self {
        Self {
            order_id,
            product_id,
            price,
            quantity,
        }
    }

    /// Rejects orders no activity could ever process.
    pub fn validate(&self) -> Result<()> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(SagaError::InvalidInput(format!(
                "price must be positive, got {}",
                self.price
            )));
        }
        if self.quantity == 0 {
            return Err(SagaError::InvalidInput(
                "quantity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn amount(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

/// Queues and retry settings for the order fulfillment activities.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFulfillmentConfig {
    pub payment_queue: String,
    pub shipping_queue: String,
    pub retry_policy: RetryPolicy,
    pub start_to_close_timeout: Duration,
}

impl Default for OrderFulfillmentConfig {
    fn default() -> Self {
        Self {
            payment_queue: PAYMENT_ACTIVITY_TASK_QUEUE.to_string(),
            shipping_queue: SHIPPING_ACTIVITY_TASK_QUEUE.to_string(),
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(60),
        }
    }
}

impl OrderFulfillmentConfig {
    fn options(&self, queue: &str) -> ActivityOptions {
        ActivityOptions::new(queue)
            .with_retry_policy(self.retry_policy.clone())
            .with_start_to_close_timeout(self.start_to_close_timeout)
    }
}

/// Builds the two-step saga definition.
pub fn definition(config: &OrderFulfillmentConfig) -> SagaDefinition {
    let payment = config.options(&config.payment_queue);
    let shipping = config.options(&config.shipping_queue);

    SagaDefinition::new(WORKFLOW_TYPE)
        .step(
            Step::new("payment", ActivitySpec::new(DEBIT_PAYMENT, payment.clone()))
                .with_compensation(ActivitySpec::new(REFUND_PAYMENT, payment)),
        )
        .step(Step::new("shipment", ActivitySpec::new(SHIP_ORDER, shipping)))
}

pub fn workflow(config: &OrderFulfillmentConfig) -> SagaWorkflow {
    SagaWorkflow::new(definition(config))
}

/// `<prefix>-<orderId>-<startMillis>`
pub fn execution_id(prefix: &str, order_id: i64, start_millis: i64) -> ExecutionId {
    ExecutionId::compose(prefix, order_id, start_millis)
}

/// Validates the order and starts an order fulfillment execution.
///
/// The workflow must already be registered with `engine`.
#[tracing::instrument(skip(engine, order), fields(order_id = order.order_id))]
pub async fn start_order(
    engine: &WorkflowEngine,
    execution_id: ExecutionId,
    order: &OrderInput,
) -> Result<ExecutionHandle> {
    order.validate()?;
    let input = serde_json::to_value(order)?;
    Ok(engine.start(execution_id, WORKFLOW_TYPE, input).await?)
}
