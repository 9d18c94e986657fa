//! Unverified expiry inspection for bearer tokens
//!
//! Reads the `exp` claim from the payload segment of a `header.payload.sig`
//! token. No signature check happens here: the server remains the authority,
//! this only saves a round-trip for a token we already know is stale.
//!
//! Tokens of any other shape, undecodable payloads, and payloads without a
//! numeric `exp` are reported as not expired.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Decode the `exp` claim as unix milliseconds, if the token carries one.
pub fn expires_at_millis(token: &str) -> Option<u64> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_f64()?;
    if !exp.is_finite() {
        return None;
    }
    // Pre-epoch expiry is still an expiry
    Some((exp.max(0.0) * 1000.0) as u64)
}

/// Whether `token` is past its expiry, treating it as expired `skew` early.
pub fn is_expired(token: &str, skew: Duration) -> bool {
    let now_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    is_expired_at(token, skew, now_millis)
}

/// Pure variant of [`is_expired`] against an explicit clock reading.
///
/// Expired iff `now + skew > exp`, so with zero skew a token stays usable up
/// to and including its expiry instant.
pub fn is_expired_at(token: &str, skew: Duration, now_millis: u64) -> bool {
    match expires_at_millis(token) {
        Some(exp_millis) => now_millis.saturating_add(skew.as_millis() as u64) > exp_millis,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_payload(payload: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        format!("{header}.{body}.c2lnbmF0dXJl")
    }

    #[test]
    fn reads_integer_exp_claim() {
        let token = token_with_payload(r#"{"sub":"u1","exp":1700000000}"#);
        assert_eq!(expires_at_millis(&token), Some(1_700_000_000_000));
    }

    #[test]
    fn reads_fractional_exp_claim() {
        let token = token_with_payload(r#"{"exp":1700000000.5}"#);
        assert_eq!(expires_at_millis(&token), Some(1_700_000_000_500));
    }

    #[test]
    fn tolerates_padded_payload() {
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let body = base64::engine::general_purpose::URL_SAFE.encode(br#"{"exp":10}"#);
        let token = format!("{header}.{body}.sig");
        assert_eq!(expires_at_millis(&token), Some(10_000));
    }

    #[test]
    fn unrecognized_shapes_are_never_expired() {
        assert!(!is_expired_at("opaque-token", Duration::ZERO, u64::MAX / 2));
        assert!(!is_expired_at("a.b", Duration::ZERO, u64::MAX / 2));
        assert!(!is_expired_at("a.b.c.d", Duration::ZERO, u64::MAX / 2));
        assert!(!is_expired_at("a.!!!.c", Duration::ZERO, u64::MAX / 2));

        let no_exp = token_with_payload(r#"{"sub":"u1"}"#);
        assert!(!is_expired_at(&no_exp, Duration::ZERO, u64::MAX / 2));

        let string_exp = token_with_payload(r#"{"exp":"1700000000"}"#);
        assert!(!is_expired_at(&string_exp, Duration::ZERO, u64::MAX / 2));
    }

    #[test]
    fn negative_exp_counts_as_expired() {
        let token = token_with_payload(r#"{"exp":-5}"#);
        assert_eq!(expires_at_millis(&token), Some(0));
        assert!(is_expired_at(&token, Duration::ZERO, 1));
        assert!(is_expired(&token, Duration::ZERO));
    }

    #[test]
    fn expiry_boundary_without_skew() {
        let token = token_with_payload(r#"{"exp":1000}"#);
        assert!(!is_expired_at(&token, Duration::ZERO, 999_999));
        assert!(!is_expired_at(&token, Duration::ZERO, 1_000_000));
        assert!(is_expired_at(&token, Duration::ZERO, 1_000_001));
    }

    #[test]
    fn skew_expires_token_early() {
        let token = token_with_payload(r#"{"exp":1000}"#);
        let skew = Duration::from_secs(30);
        // 20s before expiry: inside the margin
        assert!(is_expired_at(&token, skew, 980_000));
        // exactly the margin before expiry: still usable
        assert!(!is_expired_at(&token, skew, 970_000));
    }
}
