/// Error types for the device command service.
///
/// Domain and infrastructure failures map onto one HTTP response shape:
/// `{"error": <stable code>, "message": <user-safe text>}`. The message
/// text is not a contract; the code and status are.
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

/// Result type for device-service operations
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed input or a forbidden domain transition
    #[error("{0}")]
    Validation(String),

    /// Tenant-scoped lookup miss
    #[error("{0}")]
    NotFound(String),

    /// Optimistic-version mismatch on update
    #[error("{0}")]
    Conflict(String),

    /// Missing or mismatched internal headers
    #[error("{0}")]
    Unauthorized(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(String),
}

impl AppError {
    fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Database(_) => "internal_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.error_code(),
            "message": self.to_string(),
        }))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<db_pool::SessionError> for AppError {
    fn from(err: db_pool::SessionError) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<transactional_outbox::OutboxError> for AppError {
    fn from(err: transactional_outbox::OutboxError) -> Self {
        AppError::Database(err.to_string())
    }
}
