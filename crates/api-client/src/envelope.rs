//! `{ success, data?, message?, error? }` response envelope
//!
//! Only payloads carrying a boolean `success` are envelopes. Anything else is
//! passed through untouched.

use serde_json::Value;

use crate::error::ApiError;

/// Status used for `success: false` bodies that don't name their own.
const DEFAULT_ENVELOPE_STATUS: u16 = 400;

/// Unwrap an envelope arriving with a 2xx status.
///
/// `success: true` yields `data` when present, otherwise the whole payload.
/// `success: false` is an error even though the HTTP status was a success.
pub fn unwrap_envelope(payload: Value) -> Result<Value, ApiError> {
    let Some(success) = payload.get("success").and_then(Value::as_bool) else {
        return Ok(payload);
    };

    if !success {
        let status = envelope_status(&payload).unwrap_or(DEFAULT_ENVELOPE_STATUS);
        return Err(ApiError::normalize(&payload, status, "Request failed"));
    }

    match payload {
        Value::Object(mut map) => match map.remove("data") {
            Some(data) => Ok(data),
            None => Ok(Value::Object(map)),
        },
        other => Ok(other),
    }
}

/// Error status named by the payload itself, if it is a 4xx/5xx code.
fn envelope_status(payload: &Value) -> Option<u16> {
    ["status", "statusCode"]
        .iter()
        .filter_map(|field| payload.get(*field))
        .chain(payload.get("error").and_then(|e| e.get("status")))
        .find_map(Value::as_u64)
        .filter(|status| (400..=599).contains(status))
        .map(|status| status as u16)
}
