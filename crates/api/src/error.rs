//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use engine::EngineError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    /// Workflow engine error.
    Engine(EngineError),
    /// Saga start error.
    Saga(SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Engine(err) => engine_error_to_response(err),
            ApiError::Saga(err) => saga_error_to_response(err),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn engine_error_to_response(err: EngineError) -> (StatusCode, String) {
    let status = match &err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AlreadyRunning(_) | EngineError::AlreadyExists(_) | EngineError::NotActive(_) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match err {
        SagaError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
        SagaError::Engine(err) => engine_error_to_response(err),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

#[cfg(test)]
mod tests {
    use engine::ExecutionId;

    use super::*;

    fn status(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        let id = ExecutionId::new("order-1-1");
        assert_eq!(
            status(EngineError::NotFound(id.clone()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(EngineError::AlreadyRunning(id.clone()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(SagaError::Engine(EngineError::AlreadyExists(id)).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(SagaError::InvalidInput("quantity".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(EngineError::InvalidHistory("gap".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
