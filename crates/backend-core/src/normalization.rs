use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{
        AUTH_ERROR, BackendError, BackendErrorCategory, NETWORK_ERROR, UNKNOWN_ERROR,
        VALIDATION_ERROR, classify_http_status,
    },
    types::{BackendEvent, MutationAck, MutationKind},
};

/// Error part of the normalized result shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Uniform result returned by every transport call.
///
/// Callers distinguish network, server and validation failures only through
/// `error.code`, never structurally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            error: None,
        }
    }

    pub fn failure(error: BackendError) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(error.message.clone()),
            error: Some(ApiErrorBody {
                code: error.code,
                message: error.message,
                details: error.details,
            }),
        }
    }

    pub fn from_result(result: Result<T, BackendError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::failure(error),
        }
    }

    /// Stable error code of a failed response.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|error| error.code.as_str())
    }

    /// Convert back into a `Result`, re-deriving the error category from the code.
    pub fn into_result(self) -> Result<T, BackendError> {
        if let Some(error) = self.error {
            let mut mapped =
                BackendError::new(category_for_code(&error.code), error.code, error.message);
            mapped.details = error.details;
            return Err(mapped);
        }

        match self.data {
            Some(data) if self.success => Ok(data),
            _ => Err(BackendError::unknown(
                self.message
                    .unwrap_or_else(|| "response carried neither data nor error".to_owned()),
            )),
        }
    }
}

/// Recover an error category from a stable error code.
pub fn category_for_code(code: &str) -> BackendErrorCategory {
    match code {
        NETWORK_ERROR => BackendErrorCategory::Network,
        AUTH_ERROR => BackendErrorCategory::Auth,
        VALIDATION_ERROR => BackendErrorCategory::Validation,
        UNKNOWN_ERROR => BackendErrorCategory::Unknown,
        other => other
            .parse::<u16>()
            .map(classify_http_status)
            .unwrap_or(BackendErrorCategory::Unknown),
    }
}

/// Build the error for a response that arrived with a failure status.
///
/// The message comes from the first structured validation error when present,
/// then from a top-level `message`, then a generic server message.
pub fn normalize_failure_response(status: u16, body: &str) -> BackendError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let errors = parsed
        .as_ref()
        .and_then(|value| value.get("errors"))
        .filter(|errors| errors.is_array())
        .cloned();

    let first_validation_message = errors
        .as_ref()
        .and_then(|errors| errors.as_array())
        .and_then(|errors| errors.first())
        .and_then(|first| {
            first
                .get("msg")
                .or_else(|| first.get("message"))
                .and_then(Value::as_str)
        })
        .map(ToOwned::to_owned);

    let top_level_message = parsed
        .as_ref()
        .and_then(|value| value.get("message"))
        .and_then(Value::as_str)
        .filter(|message| !message.trim().is_empty())
        .map(ToOwned::to_owned);

    let message = first_validation_message
        .or(top_level_message)
        .unwrap_or_else(|| format!("Server error ({status})"));

    let mut error = BackendError::new(classify_http_status(status), status.to_string(), message);
    if let Some(errors) = errors {
        error = error.with_details(errors);
    }
    error
}

/// Strip a `{ "success": true, "data": … }` envelope when the server used one.
pub fn unwrap_success_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map)
            if map.get("success").is_some_and(Value::is_boolean) && map.contains_key("data") =>
        {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Convert an optimistic mutation outcome to a stable `BackendEvent::MutationAck`.
pub fn normalize_mutation_outcome(
    conversation_id: impl Into<String>,
    kind: MutationKind,
    outcome: Result<(), BackendError>,
) -> BackendEvent {
    let conversation_id = conversation_id.into();
    match outcome {
        Ok(()) => BackendEvent::MutationAck(MutationAck {
            conversation_id,
            kind,
            success: true,
            error: None,
        }),
        Err(error) => BackendEvent::MutationAck(MutationAck {
            conversation_id,
            kind,
            success: false,
            error: Some(error),
        }),
    }
}

/// Convert an error into a user-facing `BackendEvent::Error`.
pub fn normalize_error_event(error: BackendError) -> BackendEvent {
    BackendEvent::Error {
        recoverable: error.category.is_retryable(),
        code: error.code,
        message: error.message,
    }
}
