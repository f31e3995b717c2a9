use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pollcast_core::CoreError;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    PollClosed(String),
    #[error("already voted in this poll")]
    DuplicateVote,
    #[error("rate limited")]
    RateLimited,
    /// Transient failure. The detail is logged, never shown to the caller.
    #[error("service temporarily unavailable, try again shortly")]
    ServiceUnavailable(String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Machine-readable error code string.
    fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::PollClosed(_) => "POLL_CLOSED",
            ApiError::DuplicateVote => "DUPLICATE_VOTE",
            ApiError::RateLimited => "RATE_LIMITED",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PollClosed(_) | ApiError::DuplicateVote => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                "internal server error".to_string()
            }
            ApiError::ServiceUnavailable(detail) => {
                tracing::warn!(detail = %detail, "API request failed transiently");
                self.to_string()
            }
            other => other.to_string(),
        };

        let details = match &self {
            ApiError::ServiceUnavailable(_) => json!({ "retryable": true }),
            _ => Value::Null,
        };

        let body = json!({
            "code": code,
            "message": message,
            // Keep legacy "error" field for backwards compatibility
            "error": message,
            "details": details,
        });

        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        if e.is_transient() {
            return ApiError::ServiceUnavailable(e.to_string());
        }
        match e {
            CoreError::NotFound(_) => ApiError::NotFound(e.to_string()),
            CoreError::Closed(_) => ApiError::PollClosed(e.to_string()),
            CoreError::InvalidOption { .. } => ApiError::BadRequest(e.to_string()),
            CoreError::Validation(msg) => ApiError::BadRequest(msg),
            CoreError::DuplicateSubmission => ApiError::DuplicateVote,
            CoreError::RateLimited => ApiError::RateLimited,
            CoreError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
            CoreError::Contention | CoreError::Unavailable(_) | CoreError::Database(_) => {
                ApiError::ServiceUnavailable(e.to_string())
            }
        }
    }
}
