use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::FlowError;

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable kind, used by the remote client to rebuild the error.
    pub code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

/// Application error type that converts to HTTP responses.
pub enum AppError {
    BadRequest(String),
    Flow(FlowError),
}

impl AppError {
    fn parts(self) -> (StatusCode, ErrorResponse) {
        let err = match self {
            AppError::BadRequest(msg) => {
                return (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse {
                        error: msg,
                        code: "bad_request".to_string(),
                        details: Vec::new(),
                        stacktrace: None,
                    },
                );
            }
            AppError::Flow(err) => err,
        };

        let error = err.to_string();
        let (status, code, details, stacktrace) = match err {
            FlowError::Validation { errors, .. } => (StatusCode::BAD_REQUEST, "validation", errors, None),
            FlowError::Authorization(_) => (StatusCode::FORBIDDEN, "authorization", Vec::new(), None),
            FlowError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found", Vec::new(), None),
            FlowError::UnknownFlow(_) => (StatusCode::NOT_FOUND, "unknown_flow", Vec::new(), None),
            FlowError::NotBlocked { .. } => (StatusCode::CONFLICT, "not_blocked", Vec::new(), None),
            FlowError::Conflict { .. } => (StatusCode::CONFLICT, "conflict", Vec::new(), None),
            FlowError::StillRunning { .. } => (StatusCode::CONFLICT, "still_running", Vec::new(), None),
            FlowError::Execution { message, stacktrace } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "execution", vec![message], stacktrace)
            }
            FlowError::NotDurable(_) => (StatusCode::INTERNAL_SERVER_ERROR, "not_durable", Vec::new(), None),
            _ => {
                error!(error = %error, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", Vec::new(), None)
            }
        };

        (
            status,
            ErrorResponse {
                error,
                code: code.to_string(),
                details,
                stacktrace,
            },
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        (status, Json(body)).into_response()
    }
}

impl From<FlowError> for AppError {
    fn from(err: FlowError) -> Self {
        AppError::Flow(err)
    }
}
