//! Caller-visible request errors
//!
//! Every failed request surfaces as one `ApiError`: a message, the HTTP
//! status (0 when no response arrived), and the optional machine-readable
//! code and details the server put in a nested `error` object.

use serde::Serialize;
use serde_json::Value;

/// Code for mutating calls blocked by the access policy
pub const READ_ONLY_CODE: &str = "READ_ONLY";

/// Code for requests that never produced an HTTP response
pub const NETWORK_ERROR_CODE: &str = "NETWORK_ERROR";

/// Code for successful responses whose payload did not match the expected type
pub const INVALID_RESPONSE_CODE: &str = "INVALID_RESPONSE";

/// Fallback message when neither the payload nor the status line has one
const FALLBACK_MESSAGE: &str = "Request failed";

/// Normalized API failure. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    message: String,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ApiError {
    pub fn new(message: impl Into<String>, status: u16, code: Option<String>) -> Self {
        Self {
            message: message.into(),
            status,
            code,
            details: None,
        }
    }

    /// Build an error from a raw response payload.
    ///
    /// Message resolution: string payload, then the nested `error` (a string,
    /// or an object's `message`), then the top-level `message`, then the
    /// status text. `code` and `details` only come from a nested error object.
    pub fn normalize(payload: &Value, status: u16, status_text: &str) -> Self {
        let nested = payload.get("error");
        let nested_object = nested.filter(|e| e.is_object());

        let message = non_blank(payload.as_str())
            .or_else(|| non_blank(nested.and_then(Value::as_str)))
            .or_else(|| {
                non_blank(
                    nested_object
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str),
                )
            })
            .or_else(|| non_blank(payload.get("message").and_then(Value::as_str)))
            .or_else(|| non_blank(Some(status_text)))
            .unwrap_or(FALLBACK_MESSAGE);

        let code = nested_object
            .and_then(|e| e.get("code"))
            .and_then(|code| match code {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let details = nested_object
            .and_then(|e| e.get("details"))
            .filter(|d| !d.is_null())
            .cloned();

        Self {
            message: message.to_owned(),
            status,
            code,
            details,
        }
    }

    /// Mutating call refused by the access policy before any network activity.
    pub fn read_only() -> Self {
        Self::new(
            "This account has read-only access",
            403,
            Some(READ_ONLY_CODE.into()),
        )
    }

    /// The request produced no HTTP response (connect failure, timeout, ...).
    pub fn transport(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out: {err}")
        } else {
            format!("network error: {err}")
        };
        Self::new(message, 0, Some(NETWORK_ERROR_CODE.into()))
    }

    /// A successful payload that could not be read as the requested type.
    pub fn invalid_response(err: impl std::fmt::Display) -> Self {
        Self::new(
            format!("invalid response payload: {err}"),
            0,
            Some(INVALID_RESPONSE_CODE.into()),
        )
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// The session ended; callers should send the user back to sign-in.
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn is_read_only(&self) -> bool {
        self.code.as_deref() == Some(READ_ONLY_CODE)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}
