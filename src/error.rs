use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy for the limiting engine.
///
/// Denials (429) and queue-full rejections (503) are not errors; they are
/// well-formed decisions built by the response module. These variants cover
/// configuration problems surfaced on the admin path and internal failures
/// that the middleware boundary converts into fail-open admissions.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            EngineError::InvalidRule(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_rule"),
            EngineError::InvalidConfig(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_configuration")
            }
            EngineError::Evaluation(_) | EngineError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        let body = ErrorResponse::new(kind, &self.to_string(), status.as_u16());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_rule_maps_to_422() {
        let response = EngineError::InvalidRule("bad pattern".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn internal_error_maps_to_500() {
        let response = EngineError::Internal("boom".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
