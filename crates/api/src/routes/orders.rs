//! Order fulfillment start endpoint.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use engine::ExecutionStatus;
use saga::OrderInput;
use saga::order_fulfillment;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    /// Assigned by the server when absent.
    pub order_id: Option<i64>,
    pub product_id: i64,
    pub price: f64,
    pub quantity: u32,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct OrderAcceptedResponse {
    pub execution_id: String,
    pub order_id: i64,
    pub status: ExecutionStatus,
}

// -- Handlers --

/// POST /orders: start an order fulfillment workflow.
///
/// Returns as soon as the execution is recorded; progress is polled
/// through `GET /workflows/{id}`.
#[tracing::instrument(skip(state, req))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderAcceptedResponse>), ApiError> {
    let order_id = req
        .order_id
        .unwrap_or_else(|| state.next_order_id.fetch_add(1, Ordering::Relaxed));
    let order = OrderInput::new(order_id, req.product_id, req.price, req.quantity);

    let execution_id = order_fulfillment::execution_id(
        &state.config.workflow_id_prefix,
        order_id,
        chrono::Utc::now().timestamp_millis(),
    );
    let handle = order_fulfillment::start_order(&state.engine, execution_id, &order).await?;

    metrics::counter!("orders_accepted_total").increment(1);
    tracing::info!(execution_id = %handle.execution_id(), order_id, "order fulfillment started");
    Ok((
        StatusCode::ACCEPTED,
        Json(OrderAcceptedResponse {
            execution_id: handle.execution_id().to_string(),
            order_id,
            status: ExecutionStatus::Running,
        }),
    ))
}
