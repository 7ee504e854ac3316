//! Shipping service trait, in-memory implementation and activity handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use activity::{ActivityError, ActivityHandler, ActivityTask};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::order_fulfillment::{OrderInput, SHIP_ORDER};

/// Product id the demo catalogue cannot ship.
pub const UNSHIPPABLE_PRODUCT_ID: i64 = 999;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shipment {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: u32,
    pub tracking_number: String,
}

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Ships the order. Calls sharing an idempotency key return the same shipment.
    async fn ship(&self, idempotency_key: &str, order: &OrderInput)
    -> Result<Shipment, ActivityError>;
}

#[derive(Debug)]
struct InMemoryShippingState {
    shipments: HashMap<i64, Shipment>,
    by_key: HashMap<String, i64>,
    unshippable: HashSet<i64>,
    next_id: i64,
    transient_failures: u32,
    ship_calls: u32,
}

impl Default for InMemoryShippingState {
    fn default() -> Self {
        Self {
            shipments: HashMap::new(),
            by_key: HashMap::new(),
            unshippable: HashSet::from([UNSHIPPABLE_PRODUCT_ID]),
            next_id: 0,
            transient_failures: 0,
            ship_calls: 0,
        }
    }
}

/// In-memory shipping service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a product as impossible to ship.
    pub fn add_unshippable(&self, product_id: i64) {
        self.state.write().unshippable.insert(product_id);
    }

    /// The next `n` shipments fail with a retryable error.
    pub fn set_transient_failures(&self, n: u32) {
        self.state.write().transient_failures = n;
    }

    pub fn ship_calls(&self) -> u32 {
        self.state.read().ship_calls
    }

    pub fn shipment_count(&self) -> usize {
        self.state.read().shipments.len()
    }

    pub fn shipment_for_order(&self, order_id: i64) -> Option<Shipment> {
        self.state
            .read()
            .shipments
            .values()
            .find(|s| s.order_id == order_id)
            .cloned()
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn ship(
        &self,
        idempotency_key: &str,
        order: &OrderInput,
    ) -> Result<Shipment, ActivityError> {
        let mut state = self.state.write();
        state.ship_calls += 1;

        if let Some(shipment) = state
            .by_key
            .get(idempotency_key)
            .and_then(|id| state.shipments.get(id))
        {
            return Ok(shipment.clone());
        }
        if state.unshippable.contains(&order.product_id) {
            return Err(ActivityError::non_retryable(format!(
                "product {} cannot be shipped",
                order.product_id
            )));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ActivityError::retryable("carrier unavailable"));
        }

        state.next_id += 1;
        let shipment = Shipment {
            id: state.next_id,
            order_id: order.order_id,
            product_id: order.product_id,
            quantity: order.quantity,
            tracking_number: Uuid::new_v4().simple().to_string()[..8].to_string(),
        };
        state.shipments.insert(shipment.id, shipment.clone());
        state
            .by_key
            .insert(idempotency_key.to_string(), shipment.id);

        tracing::info!(
            order_id = shipment.order_id,
            tracking_number = %shipment.tracking_number,
            "order shipped"
        );
        Ok(shipment)
    }
}

/// Handles `shipOrder` tasks. The output is the tracking number.
pub struct ShippingActivities<S> {
    service: S,
}

impl<S: ShippingService> ShippingActivities<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: ShippingService> ActivityHandler for ShippingActivities<S> {
    async fn execute(&self, task: &ActivityTask) -> Result<serde_json::Value, ActivityError> {
        if task.activity_type != SHIP_ORDER {
            return Err(ActivityError::non_retryable(format!(
                "shipping activities cannot handle {}",
                task.activity_type
            )));
        }
        let order: OrderInput = serde_json::from_value(task.input.clone())
            .map_err(|e| ActivityError::non_retryable(format!("invalid order: {e}")))?;
        let shipment = self.service.ship(&task.idempotency_key, &order).await?;
        Ok(serde_json::Value::String(shipment.tracking_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ship() {
        let service = InMemoryShippingService::new();
        let shipment = service
            .ship("exec/2", &OrderInput::new(5, 1, 10.0, 2))
            .await
            .unwrap();

        assert_eq!(shipment.order_id, 5);
        assert_eq!(shipment.quantity, 2);
        assert_eq!(shipment.tracking_number.len(), 8);
        assert_eq!(service.shipment_for_order(5), Some(shipment));
    }

    #[tokio::test]
    async fn test_ship_is_idempotent_per_key() {
        let service = InMemoryShippingService::new();
        let order = OrderInput::new(5, 1, 10.0, 2);

        let first = service.ship("exec/2", &order).await.unwrap();
        let again = service.ship("exec/2", &order).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(service.shipment_count(), 1);
        assert_eq!(service.ship_calls(), 2);
    }

    #[tokio::test]
    async fn test_unshippable_product() {
        let service = InMemoryShippingService::new();
        let err = service
            .ship("exec/2", &OrderInput::new(5, UNSHIPPABLE_PRODUCT_ID, 10.0, 1))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        service.add_unshippable(7);
        assert!(service.ship("exec/3", &OrderInput::new(6, 7, 1.0, 1)).await.is_err());
        assert_eq!(service.shipment_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure() {
        let service = InMemoryShippingService::new();
        service.set_transient_failures(1);
        let order = OrderInput::new(5, 1, 10.0, 1);

        assert!(service.ship("k", &order).await.unwrap_err().is_retryable());
        assert!(service.ship("k", &order).await.is_ok());
    }
}
