//! API error type — the closed set of wire error codes.
//!
//! Every non-2xx response carries `{ code, message, details? }`. The code
//! set is fixed; handlers map subsystem errors into it and never leak
//! internal detail to unauthenticated callers.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Wrong credentials or unknown handshake. Never distinguishes which
    /// field was wrong. Carries the advisory cooldown for `Retry-After`.
    #[error("authentication failed")]
    AuthenticationFailed { retry_after_secs: u64 },

    /// Client is locked out; `Retry-After` carries the remaining cooldown.
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// Missing or malformed `Authorization` header.
    #[error("unauthorized")]
    Unauthorized,

    #[error("session invalid")]
    SessionInvalid,

    #[error("session expired")]
    SessionExpired,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("bundle exceeds maximum decoded size")]
    BundleTooLarge,

    #[error("bundle exceeds maximum file count")]
    TooManyFiles,

    #[error("file mode out of range")]
    InvalidFileMode,

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("sentinel file already exists")]
    SentinelExists,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionInvalid => "SESSION_INVALID",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::PathNotAllowed(_) => "PATH_NOT_ALLOWED",
            Self::BundleTooLarge => "BUNDLE_TOO_LARGE",
            Self::TooManyFiles => "TOO_MANY_FILES",
            Self::InvalidFileMode => "INVALID_FILE_MODE",
            Self::CommandNotAllowed(_) => "COMMAND_NOT_ALLOWED",
            Self::CommandFailed(_) => "COMMAND_FAILED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::SentinelExists => "SENTINEL_FILE_EXISTS",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthenticationFailed { .. }
            | Self::Unauthorized
            | Self::SessionInvalid
            | Self::SessionExpired => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRequest(_)
            | Self::InvalidPath(_)
            | Self::PathNotAllowed(_)
            | Self::BundleTooLarge
            | Self::TooManyFiles
            | Self::InvalidFileMode => StatusCode::BAD_REQUEST,
            Self::CommandNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::ShuttingDown | Self::SentinelExists => StatusCode::CONFLICT,
            Self::CommandFailed(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::AuthenticationFailed { retry_after_secs } if *retry_after_secs > 0 => {
                Some(*retry_after_secs)
            }
            Self::RateLimited { retry_after_secs } => Some((*retry_after_secs).max(1)),
            _ => None,
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: None,
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
