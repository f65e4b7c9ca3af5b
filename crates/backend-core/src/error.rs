use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionState;

/// Stable code for failures where no response reached the caller.
pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
/// Stable code for request shape/content rejected by the server.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Stable code for authorization that could not be recovered by renewal.
pub const AUTH_ERROR: &str = "AUTH_ERROR";
/// Stable code for anything that does not fit another class.
pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// No response reached the caller (unreachable host, timeout).
    Network,
    /// Server rejected request shape or content.
    Validation,
    /// Authentication/authorization failure.
    Auth,
    /// Server responded with a 5xx status.
    Server,
    /// Rate-limited by the server.
    RateLimited,
    /// Credential store or other local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal invariant break or invalid state transition.
    Internal,
    /// Unclassified failure.
    Unknown,
}

impl BackendErrorCategory {
    /// Whether the user can reasonably retry the failed action.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Server | Self::RateLimited | Self::Unknown
        )
    }
}

/// Stable error payload emitted across crate and channel boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: BackendErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured server detail, when the server sent any.
    pub details: Option<serde_json::Value>,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    /// Construct a new backend error.
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            details: None,
            retry_after_ms: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Network, NETWORK_ERROR, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Auth, AUTH_ERROR, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Unknown, UNKNOWN_ERROR, message)
    }

    /// Attach structured server detail to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SessionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            BackendErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }

    pub fn is_auth(&self) -> bool {
        self.category == BackendErrorCategory::Auth
    }
}

/// Map HTTP status codes to backend error categories.
pub fn classify_http_status(status: u16) -> BackendErrorCategory {
    match status {
        401 | 403 => BackendErrorCategory::Auth,
        408 | 429 => BackendErrorCategory::RateLimited,
        400..=499 => BackendErrorCategory::Validation,
        500..=599 => BackendErrorCategory::Server,
        _ => BackendErrorCategory::Unknown,
    }
}
