use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::limiter::RateLimitExceeded;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid identification: {0}, this url does not exist")]
    InvalidTarget(String),
    #[error("Could not get request with id {0}")]
    InvalidRequestReference(i64),
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("Missing ident")]
    Unauthenticated,
    #[error("Unauthorized")]
    Unauthorized,
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error("Host {0} not allowed")]
    UnsafeDestination(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Database(err) => {
                tracing::error!(error = ?err, "database operation failed");
                return envelope(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_owned(),
                );
            }
            AppError::Internal(message) => {
                tracing::error!(message, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_)
            | AppError::InvalidTarget(_)
            | AppError::InvalidRequestReference(_)
            | AppError::InvalidDestination(_)
            | AppError::UnsafeDestination(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::RateLimited(exceeded) => {
                tracing::warn!(
                    window_index = exceeded.window_index,
                    count = exceeded.count,
                    allowed = exceeded.allowed,
                    "replay rate limit exceeded"
                );
                StatusCode::TOO_MANY_REQUESTS
            }
        };

        envelope(status, self.to_string())
    }
}

fn envelope(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ErrorBody {
            success: false,
            message,
        }),
    )
        .into_response()
}
