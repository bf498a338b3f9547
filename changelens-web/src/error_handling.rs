use axum::{
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use changelens_core::CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: String) -> Self {
        Self {
            error: error_type.to_string(),
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: Option<String>) -> Self {
        self.hint = hint;
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            AppError::Core(core) => {
                let status = match core {
                    CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
                    CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                    CoreError::Conflict { .. } => StatusCode::CONFLICT,
                    CoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    CoreError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
                    CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    CoreError::Invariant { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!("core error: {}", core);
                } else {
                    warn!("request failed: {}", core);
                }
                (
                    status,
                    ErrorResponse::new(core.kind(), core.to_string())
                        .with_hint(core.hint().map(str::to_string)),
                )
            }
            AppError::BadRequest { message } => {
                warn!("bad request: {}", message);
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::new("bad_request", message.clone()),
                )
            }
            AppError::Internal { message } => {
                error!("internal error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("internal_error", "An internal error occurred".to_string()),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

// 404 handler
pub async fn handle_404(uri: Uri) -> impl IntoResponse {
    let error_response =
        ErrorResponse::new("not_found", format!("No route found for {}", uri.path()));
    (StatusCode::NOT_FOUND, Json(error_response))
}

// Result type alias
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_expected_statuses() {
        let cases = [
            (CoreError::validation("x"), StatusCode::BAD_REQUEST),
            (CoreError::not_found("x"), StatusCode::NOT_FOUND),
            (CoreError::conflict("x"), StatusCode::CONFLICT),
            (CoreError::unavailable("x"), StatusCode::SERVICE_UNAVAILABLE),
            (CoreError::not_implemented("x"), StatusCode::NOT_IMPLEMENTED),
            (CoreError::timeout("x"), StatusCode::GATEWAY_TIMEOUT),
            (CoreError::invariant("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (core, expected) in cases {
            let response = AppError::from(core).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
