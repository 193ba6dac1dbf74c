//! HTTP Error Handling
//!
//! 业务错误统一返回 HTTP 200 + `{errno, error, data}`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::application::ApplicationError;

/// 统一错误响应格式
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errno: i32,
    pub error: String,
    pub data: Option<()>,
}

impl ErrorResponse {
    pub fn new(errno: i32, error: impl Into<String>) -> Self {
        Self {
            errno,
            error: error.into(),
            data: None,
        }
    }
}

/// 错误码定义
pub mod errno {
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;
    pub const CONFLICT: i32 = 409;
    pub const INTERNAL_ERROR: i32 = 500;
    pub const SERVICE_UNAVAILABLE: i32 = 503;
}

/// API 错误
#[derive(Debug, PartialEq, Eq)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
    Conflict(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn errno(&self) -> i32 {
        match self {
            ApiError::NotFound(_) => errno::NOT_FOUND,
            ApiError::BadRequest(_) => errno::BAD_REQUEST,
            ApiError::Internal(_) => errno::INTERNAL_ERROR,
            ApiError::Conflict(_) => errno::CONFLICT,
            ApiError::ServiceUnavailable(_) => errno::SERVICE_UNAVAILABLE,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Internal(msg)
            | ApiError::Conflict(msg)
            | ApiError::ServiceUnavailable(msg) => msg,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let errno = self.errno();
        match &self {
            ApiError::NotFound(msg) => {
                tracing::warn!(errno, error = %msg, "Resource not found")
            }
            ApiError::BadRequest(msg) => tracing::warn!(errno, error = %msg, "Bad request"),
            ApiError::Conflict(msg) => tracing::warn!(errno, error = %msg, "Resource conflict"),
            ApiError::Internal(msg) => {
                tracing::error!(errno, error = %msg, "Internal server error")
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::error!(errno, error = %msg, "Service unavailable")
            }
        }

        let response = ErrorResponse::new(errno, self.message());
        (StatusCode::OK, Json(response)).into_response()
    }
}

impl From<ApplicationError> for ApiError {
    fn from(e: ApplicationError) -> Self {
        let message = e.to_string();
        match e {
            ApplicationError::UnknownTask(_) | ApplicationError::NotFound { .. } => {
                ApiError::NotFound(message)
            }
            ApplicationError::ValidationError(msg) => ApiError::BadRequest(msg),
            ApplicationError::ArchiveCorruption(_) => ApiError::BadRequest(message),
            ApplicationError::InvalidState(msg) => ApiError::Conflict(msg),
            ApplicationError::Cancelled(_) => ApiError::Conflict(message),
            ApplicationError::TransportFailure(_)
            | ApplicationError::SubmissionTimeout(_)
            | ApplicationError::ExternalServiceError(_) => ApiError::ServiceUnavailable(message),
            ApplicationError::StorageFailure(_) => ApiError::Internal(message),
            ApplicationError::RepositoryError(msg) => ApiError::Internal(msg),
            ApplicationError::InternalError(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_mapping() {
        assert_eq!(
            ApiError::from(ApplicationError::unknown_task("t1")).errno(),
            errno::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ApplicationError::not_found("Artifact", "t1/a.png")),
            ApiError::NotFound("Artifact not found: t1/a.png".to_string())
        );
        assert_eq!(
            ApiError::from(ApplicationError::invalid_state("done")).errno(),
            errno::CONFLICT
        );
        assert_eq!(
            ApiError::from(ApplicationError::TransportFailure("closed".into())).errno(),
            errno::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(ApplicationError::validation("empty")),
            ApiError::BadRequest("empty".to_string())
        );
    }
}
