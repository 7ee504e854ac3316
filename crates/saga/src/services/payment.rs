//! Payment service trait, in-memory implementation and activity handler.

use std::collections::HashMap;
use std::sync::Arc;

use activity::{ActivityError, ActivityHandler, ActivityTask};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::order_fulfillment::{DEBIT_PAYMENT, OrderInput, REFUND_PAYMENT};

/// A debit made for an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub amount: f64,
    /// Reference assigned by the payment provider.
    pub external_id: Uuid,
    pub refunded: bool,
    pub refund_id: Option<Uuid>,
}

/// Trait for payment operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Debits `price × quantity` for the order.
    ///
    /// Calls sharing an idempotency key return the same payment.
    async fn debit(&self, idempotency_key: &str, order: &OrderInput)
    -> Result<Payment, ActivityError>;

    /// Refunds a payment. Refunding twice is a no-op.
    async fn refund(&self, payment_id: i64) -> Result<Payment, ActivityError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<i64, Payment>,
    by_key: HashMap<String, i64>,
    next_id: i64,
    transient_failures: u32,
    fail_refunds: bool,
    debit_calls: u32,
    refund_calls: u32,
}

/// In-memory payment service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` debits fail with a retryable error.
    pub fn set_transient_failures(&self, n: u32) {
        self.state.write().transient_failures = n;
    }

    /// Makes every refund fail with a retryable error.
    pub fn set_fail_refunds(&self, fail: bool) {
        self.state.write().fail_refunds = fail;
    }

    pub fn debit_calls(&self) -> u32 {
        self.state.read().debit_calls
    }

    pub fn refund_calls(&self) -> u32 {
        self.state.read().refund_calls
    }

    pub fn payment(&self, payment_id: i64) -> Option<Payment> {
        self.state.read().payments.get(&payment_id).cloned()
    }

    /// All payments ordered by id.
    pub fn payments(&self) -> Vec<Payment> {
        let mut payments: Vec<_> = self.state.read().payments.values().cloned().collect();
        payments.sort_by_key(|p| p.id);
        payments
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn debit(
        &self,
        idempotency_key: &str,
        order: &OrderInput,
    ) -> Result<Payment, ActivityError> {
        let mut state = self.state.write();
        state.debit_calls += 1;

        if let Some(payment) = state
            .by_key
            .get(idempotency_key)
            .and_then(|id| state.payments.get(id))
        {
            return Ok(payment.clone());
        }
        if order.price <= 0.0 || order.quantity == 0 {
            return Err(ActivityError::non_retryable(format!(
                "invalid order {}: price {} quantity {}",
                order.order_id, order.price, order.quantity
            )));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ActivityError::retryable("payment provider unavailable"));
        }

        state.next_id += 1;
        let payment = Payment {
            id: state.next_id,
            order_id: order.order_id,
            product_id: order.product_id,
            amount: order.amount(),
            external_id: Uuid::new_v4(),
            refunded: false,
            refund_id: None,
        };
        state.payments.insert(payment.id, payment.clone());
        state
            .by_key
            .insert(idempotency_key.to_string(), payment.id);

        tracing::info!(
            payment_id = payment.id,
            order_id = payment.order_id,
            amount = payment.amount,
            "payment debited"
        );
        Ok(payment)
    }

    async fn refund(&self, payment_id: i64) -> Result<Payment, ActivityError> {
        let mut state = self.state.write();
        state.refund_calls += 1;

        if state.fail_refunds {
            return Err(ActivityError::retryable("refund endpoint unavailable"));
        }
        let payment = state.payments.get_mut(&payment_id).ok_or_else(|| {
            ActivityError::non_retryable(format!("payment {payment_id} not found"))
        })?;
        if !payment.refunded {
            payment.refunded = true;
            payment.refund_id = Some(Uuid::new_v4());
            tracing::info!(payment_id, order_id = payment.order_id, "payment refunded");
        }
        Ok(payment.clone())
    }
}

/// Handles `debitPayment` and `refundPayment` tasks.
pub struct PaymentActivities<P> {
    service: P,
}

impl<P: PaymentService> PaymentActivities<P> {
    pub fn new(service: P) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<P: PaymentService> ActivityHandler for PaymentActivities<P> {
    async fn execute(&self, task: &ActivityTask) -> Result<serde_json::Value, ActivityError> {
        match task.activity_type.as_str() {
            DEBIT_PAYMENT => {
                let order: OrderInput = serde_json::from_value(task.input.clone())
                    .map_err(|e| ActivityError::non_retryable(format!("invalid order: {e}")))?;
                let payment = self.service.debit(&task.idempotency_key, &order).await?;
                Ok(serde_json::json!(payment.id))
            }
            REFUND_PAYMENT => {
                let payment_id: i64 = serde_json::from_value(task.input.clone())
                    .map_err(|e| ActivityError::non_retryable(format!("invalid payment id: {e}")))?;
                self.service.refund(payment_id).await?;
                Ok(serde_json::Value::Null)
            }
            other => Err(ActivityError::non_retryable(format!(
                "payment activities cannot handle {other}"
            ))),
        }
    }
}
