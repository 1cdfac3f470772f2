//! Error taxonomy shared by every crate in the scheduler.
//!
//! Each variant carries a stable `code` and maps to an HTTP status for the
//! intake surface (`crawlsched-intake`), mirroring the original
//! `http_exceptions.py` error hierarchy one-for-one.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    BadRequest(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("request timed out")]
    Timeout,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl CoreError {
    /// Stable machine-readable code, used in the intake error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::Timeout => "TIMEOUT",
            Self::Conflict(_) => "CONFLICT_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_SERVER_ERROR",
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// HTTP status code for this error kind. Kept here (rather than in
    /// `crawlsched-intake`) so non-HTTP callers can still reason about
    /// severity without depending on axum.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::AuthenticationFailed => 401,
            Self::PermissionDenied(_) => 403,
            Self::NotFound(_) => 404,
            Self::MethodNotAllowed => 405,
            Self::Timeout => 408,
            Self::Conflict(_) => 409,
            Self::Validation(_) => 422,
            Self::Internal(_) => 500,
            Self::BadGateway(_) => 502,
            Self::ServiceUnavailable(_) => 503,
        }
    }
}
