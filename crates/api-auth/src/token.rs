//! Refresh endpoint call
//!
//! POSTs `{"refresh_token": ...}` as JSON to `<base>/auth/refresh`. Backends
//! differ in where they put the new pair, so the response is searched at the
//! top level and under `data`, `tokens` and `data.tokens`.

use serde::Serialize;
use serde_json::Value;

use crate::credentials::AuthTokens;
use crate::error::{Error, Result};

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Exchange a refresh token for a new pair.
///
/// The returned pair always has an access token. Its refresh token is
/// whatever the server sent, possibly `None`; falling back to the previous
/// refresh token is the caller's decision.
pub async fn refresh_tokens(
    client: &reqwest::Client,
    url: &str,
    refresh: &str,
) -> Result<AuthTokens> {
    let response = client
        .post(url)
        .json(&RefreshRequest {
            refresh_token: refresh,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the refresh token is revoked or invalid
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "refresh endpoint returned {status}: {body}"
        )));
    }

    let payload: Value = response
        .json()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;

    extract_tokens(&payload)
        .ok_or_else(|| Error::TokenExchange("refresh response has no access_token".into()))
}

/// Find the first object carrying a non-blank `access_token`.
pub(crate) fn extract_tokens(payload: &Value) -> Option<AuthTokens> {
    let candidates = [
        Some(payload),
        payload.get("data"),
        payload.get("tokens"),
        payload.get("data").and_then(|d| d.get("tokens")),
    ];

    candidates.into_iter().flatten().find_map(|candidate| {
        let text = |field: &str| {
            candidate
                .get(field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        let access_token = text("access_token")?;
        Some(AuthTokens {
            access_token: Some(access_token),
            refresh_token: text("refresh_token"),
        })
    })
}
