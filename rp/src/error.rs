//! Run error taxonomy
//!
//! Producers convert failures into [`RunError`] before reporting them as
//! `run/error` or `error/retry` events. Budget exhaustion is not
//! part of this taxonomy: it is a normal terminal condition reported through
//! dedicated events.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::ErrorPayload;
use crate::recorder::Redactor;

/// Stable classification code carried on error payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Aborted,
    Timeout,
    Transient,
    RateLimit,
    Network,
    Provider,
    Validation,
    Io,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Transient => "TRANSIENT",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::Network => "NETWORK",
            ErrorCode::Provider => "PROVIDER",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Io => "IO",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by run producers and the control plane
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Transient error: {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("Rate limited, retry after {retry_after:?}: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider error {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunError {
    /// Classify an HTTP-style status from a provider response
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => RunError::RateLimited {
                retry_after: None,
                message,
            },
            500..=599 => RunError::Transient {
                status: Some(status),
                message,
            },
            _ => RunError::Provider { status, message },
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RunError::Aborted(_) => ErrorCode::Aborted,
            RunError::Timeout(_) => ErrorCode::Timeout,
            RunError::Transient { .. } => ErrorCode::Transient,
            RunError::RateLimited { .. } => ErrorCode::RateLimit,
            RunError::Network(_) => ErrorCode::Network,
            RunError::Provider { .. } => ErrorCode::Provider,
            RunError::Validation(_) | RunError::Json(_) => ErrorCode::Validation,
            RunError::Io(_) => ErrorCode::Io,
            RunError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, RunError::RateLimited { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RunError::Aborted(_))
    }

    /// Check if retrying the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::RateLimited { .. } => true,
            RunError::Transient { .. } => true,
            RunError::Network(_) => true,
            RunError::Timeout(_) => true,
            RunError::Provider { status, .. } => *status >= 500,
            RunError::Aborted(_) => false,
            RunError::Validation(_) => false,
            RunError::Io(_) => false,
            RunError::Json(_) => false,
            RunError::Internal(_) => false,
        }
    }

    /// Get the server-suggested delay if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RunError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RunError::Transient { status, .. } => *status,
            RunError::Provider { status, .. } => Some(*status),
            RunError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Event-safe payload with secrets masked
    pub fn to_payload(&self) -> ErrorPayload {
        let redactor = Redactor::shared();
        ErrorPayload {
            message: redactor.redact_str(&self.to_string()),
            name: Some("RunError".to_string()),
            code: Some(self.code().as_str().to_string()),
            stack: None,
            data: self.status().map(|s| serde_json::json!({ "statusCode": s })),
        }
    }
}
