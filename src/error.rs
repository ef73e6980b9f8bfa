use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;

/// Errors produced by the rate limiter and its HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum ThrottlerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store error: {0}")]
    Store(String),

    /// A stored bucket field could not be parsed.
    #[error("Corrupt bucket state at '{key}': field '{field}' has value {value:?}")]
    CorruptState {
        key: String,
        field: &'static str,
        value: String,
    },

    #[error("Unexpected script reply: {0}")]
    ScriptReply(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

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

    pub fn rate_limited() -> Self {
        Self::new("rate_limit_exceeded", "Rate limit exceeded", 429)
    }

    pub fn from_throttler_error(err: &ThrottlerError) -> Self {
        let message = err.to_string();
        match err {
            ThrottlerError::Configuration(_) => Self::new("configuration_error", &message, 500),
            ThrottlerError::Validation(_) => Self::new("validation_error", &message, 422),
            ThrottlerError::Redis(_) | ThrottlerError::Store(_) => {
                Self::new("service_unavailable", &message, 503)
            }
            ThrottlerError::Timeout(_) => Self::new("store_timeout", &message, 504),
            ThrottlerError::CorruptState { .. }
            | ThrottlerError::ScriptReply(_)
            | ThrottlerError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        ErrorResponse::from_throttler_error(&self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = [
            (ThrottlerError::Validation("bad".into()), 422),
            (ThrottlerError::Store("down".into()), 503),
            (ThrottlerError::Timeout(Duration::from_millis(5)), 504),
            (ThrottlerError::ScriptReply("arity".into()), 500),
            (
                ThrottlerError::CorruptState {
                    key: "ratelimit:tb:a".into(),
                    field: "tokens",
                    value: "abc".into(),
                },
                500,
            ),
        ];

        for (err, code) in cases {
            assert_eq!(ErrorResponse::from_throttler_error(&err).code, code);
        }
    }

    #[test]
    fn test_corrupt_state_message() {
        let err = ThrottlerError::CorruptState {
            key: "ratelimit:tb:10.0.0.1".into(),
            field: "last_refill",
            value: "soon".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("last_refill"));
        assert!(msg.contains("\"soon\""));
    }
}
