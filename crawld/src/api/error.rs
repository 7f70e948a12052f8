//! API error handling.
//!
//! Every failure is rendered as `{"code": KIND, "message": text}` with an
//! HTTP status matching the error kind.

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 400 Bad Request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 404 Not Found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// 409 Conflict.
    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    /// 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    /// 503 Service Unavailable.
    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let kind = err.kind();
        match err {
            Error::NotFound { entity_type, id } => {
                ApiError::not_found(format!("{} with id '{}' not found", entity_type, id))
            }
            Error::Validation(msg) | Error::ApiError(msg) => ApiError::bad_request(msg),
            Error::Configuration(msg) => {
                tracing::error!(error = %msg, "Configuration error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, kind, msg)
            }
            Error::DuplicateId(_) | Error::InvalidStateTransition { .. } => {
                ApiError::conflict(kind, err.to_string())
            }
            Error::QueueFull { active, ceiling } => ApiError::service_unavailable(
                kind,
                format!("queue is full: {} active jobs (ceiling {})", active, ceiling),
            )
            .with_details(serde_json::json!({ "active": active, "ceiling": ceiling })),
            Error::DatabaseSqlx(e) => {
                tracing::error!(error = %e, "Database error");
                ApiError::internal("Database error occurred")
            }
            Error::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::internal("Database error occurred")
            }
            Error::Io(e) => {
                tracing::error!(error = %e, "IO error");
                ApiError::internal("IO error occurred")
            }
            _ => {
                tracing::error!(error = %err, "Unexpected error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, kind, err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err: ApiError = Error::not_found("Job", "abc").into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "NOT_FOUND");
        assert!(err.message.contains("abc"));
    }

    #[test]
    fn conflicts_keep_their_kind() {
        let err: ApiError = Error::DuplicateId("abc".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "DUPLICATE_ID");

        let err: ApiError = Error::InvalidStateTransition {
            from: "FINISHED".into(),
            to: "CANCELLED".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "INVALID_STATE_TRANSITION");
    }

    #[test]
    fn queue_full_is_service_unavailable() {
        let err: ApiError = Error::QueueFull {
            active: 10,
            ceiling: 10,
        }
        .into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "QUEUE_FULL");
        assert_eq!(err.details.unwrap()["ceiling"], 10);
    }

    #[test]
    fn validation_is_bad_request() {
        let err: ApiError = Error::validation("project is required").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "BAD_REQUEST");
        assert_eq!(err.message, "project is required");
    }

    #[test]
    fn configuration_errors_are_server_faults() {
        let err: ApiError = Error::config("runner program must not be empty").into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "CONFIGURATION_ERROR");
    }

    #[test]
    fn error_body_omits_empty_details() {
        let body = ApiErrorResponse {
            code: "NOT_FOUND".into(),
            message: "gone".into(),
            details: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"code":"NOT_FOUND","message":"gone"}"#);
    }
}
