//! Storage keys, endpoint paths and timing constants for the dashboard API

use std::time::Duration;

/// Canonical storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "carbon.auth.access_token";

/// Canonical storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "carbon.auth.refresh_token";

/// Storage key holding the authoritative scope ("persistent" or "session").
/// Always kept in the persistent scope.
pub const STORAGE_MODE_KEY: &str = "carbon.auth.storage_mode";

/// Older access token key names, checked in order after both canonical scopes.
pub const LEGACY_ACCESS_TOKEN_KEYS: &[&str] =
    &["access_token", "accessToken", "auth_token", "token"];

/// Older refresh token key names, checked in order after both canonical scopes.
pub const LEGACY_REFRESH_TOKEN_KEYS: &[&str] = &["refresh_token", "refreshToken"];

/// API path segment every base URL is normalized to end with
pub const API_PATH_SEGMENT: &str = "/api";

/// Refresh endpoint, relative to the normalized base URL
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Path fragments that never trigger a token refresh, matched
/// case-insensitively as substrings of the request path.
pub const NON_REFRESHABLE_PATHS: &[&str] = &[
    "/auth/login",
    "/auth/signin",
    "/auth/sign-in",
    "/auth/register",
    "/auth/signup",
    "/auth/sign-up",
    "/auth/refresh",
    "/auth/oauth",
    "/auth/google",
    "/auth/callback",
    "/auth/verify-email",
    "/auth/demo-login",
];

/// Lead time before expiry at which an access token is no longer handed out
/// by `RefreshCoordinator::ensure_access_token`.
pub const ACCESS_TOKEN_SKEW: Duration = Duration::from_secs(30);

/// Whether `path` belongs to the sign-in/sign-up/refresh family that must not
/// attempt a refresh before or after the request.
pub fn is_non_refreshable_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    NON_REFRESHABLE_PATHS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_paths_are_non_refreshable() {
        assert!(is_non_refreshable_path("/auth/login"));
        assert!(is_non_refreshable_path("/AUTH/Refresh"));
        assert!(is_non_refreshable_path(
            "https://dash.example.com/api/auth/google/callback?code=1"
        ));
        assert!(is_non_refreshable_path("/auth/demo-login"));
    }

    #[test]
    fn domain_paths_are_refreshable() {
        assert!(!is_non_refreshable_path("/emissions/summary"));
        assert!(!is_non_refreshable_path("/auth/me"));
        assert!(!is_non_refreshable_path("/shipments?status=open"));
    }

    #[test]
    fn legacy_keys_do_not_collide_with_canonical_keys() {
        for key in LEGACY_ACCESS_TOKEN_KEYS.iter().chain(LEGACY_REFRESH_TOKEN_KEYS) {
            assert_ne!(*key, ACCESS_TOKEN_KEY);
            assert_ne!(*key, REFRESH_TOKEN_KEY);
            assert_ne!(*key, STORAGE_MODE_KEY);
        }
    }
}
