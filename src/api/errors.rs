use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::engine::EngineError;

use super::handlers::RunSummary;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_node: Option<String>,
    /// State of the run when it stopped, for engine errors that carry one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunSummary>,
}

/// Application error type that converts to HTTP responses.
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Engine(EngineError),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, plain(msg)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, plain(msg)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, plain(msg)),
            AppError::Engine(err) => {
                let status = match &err {
                    EngineError::RunActive(_) => StatusCode::CONFLICT,
                    EngineError::NodeExecution { .. } | EngineError::Validation { .. } => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    EngineError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
                    EngineError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    EngineError::Persistence { .. } | EngineError::Graph(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let body = ErrorResponse {
                    error: err.to_string(),
                    details: None,
                    failed_node: err.failed_node().map(str::to_string),
                    run: err.state().map(RunSummary::from_state),
                };
                (status, body)
            }
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse {
                    error: "Internal server error".to_string(),
                    details: Some(format!("{:#}", err)),
                    failed_node: None,
                    run: None,
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}

fn plain(error: String) -> ErrorResponse {
    ErrorResponse {
        error,
        details: None,
        failed_node: None,
        run: None,
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err)
    }
}
