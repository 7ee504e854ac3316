//! Execution status, history and cancellation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use engine::{ExecutionId, ExecutionReport};
use saga::SagaState;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct WorkflowStatusResponse {
    #[serde(flatten)]
    pub report: ExecutionReport,
    /// Saga state machine position derived from the same history.
    pub saga_state: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryEventResponse {
    pub version: i64,
    pub event_type: &'static str,
    pub event: engine::HistoryEvent,
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub cancel_requested: bool,
}

/// GET /workflows/{id}: execution report folded from history.
#[tracing::instrument(skip(state))]
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowStatusResponse>, ApiError> {
    let execution_id = ExecutionId::new(id);
    let history = state.engine.history(&execution_id).await?;
    let report = engine::WorkflowExecution::from_history(execution_id, &history).report();

    Ok(Json(WorkflowStatusResponse {
        report,
        saga_state: SagaState::from_history(&history).to_string(),
    }))
}

/// GET /workflows/{id}/history: the raw execution history, oldest first.
#[tracing::instrument(skip(state))]
pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HistoryEventResponse>>, ApiError> {
    let history = state.engine.history(&ExecutionId::new(id)).await?;

    Ok(Json(
        history
            .into_iter()
            .zip(1i64..)
            .map(|(event, version)| HistoryEventResponse {
                version,
                event_type: event.event_type(),
                event,
            })
            .collect(),
    ))
}

/// POST /workflows/{id}/cancel: request cancellation.
///
/// The execution compensates at its next resumption point.
#[tracing::instrument(skip(state, params))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let execution_id = ExecutionId::new(id);
    let reason = params
        .reason
        .unwrap_or_else(|| "cancelled via API".to_string());
    if reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason must not be blank".to_string()));
    }

    state.engine.cancel(&execution_id, reason).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            execution_id: execution_id.to_string(),
            cancel_requested: true,
        }),
    ))
}
