//! Single-flight access token refresh
//!
//! Any number of callers may need a fresh access token at the same time. The
//! first one to find no refresh pending starts the network call; everyone who
//! arrives before it settles awaits the same shared future and gets the same
//! outcome. The shared future is also spawned onto the runtime, so it runs to
//! completion even if every caller is cancelled, and it empties the pending
//! slot itself once it has settled.
//!
//! Refresh failure is terminal for the stored pair: the store is cleared and
//! callers get `None`. Nothing here retries.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::claims::is_expired;
use crate::constants::ACCESS_TOKEN_SKEW;
use crate::credentials::{AuthTokens, CredentialStore};
use crate::token::refresh_tokens;

type PendingRefresh = Shared<BoxFuture<'static, Option<AuthTokens>>>;

/// Hands out usable access tokens, refreshing at most once at a time.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CredentialStore>,
    http_client: reqwest::Client,
    refresh_url: String,
    skew: Duration,
    pending: Mutex<Option<PendingRefresh>>,
}

impl RefreshCoordinator {
    /// Coordinator refreshing against `refresh_url` with the default
    /// [`ACCESS_TOKEN_SKEW`] safety margin.
    pub fn new(
        store: Arc<CredentialStore>,
        http_client: reqwest::Client,
        refresh_url: impl Into<String>,
    ) -> Self {
        Self::with_skew(store, http_client, refresh_url, ACCESS_TOKEN_SKEW)
    }

    pub fn with_skew(
        store: Arc<CredentialStore>,
        http_client: reqwest::Client,
        refresh_url: impl Into<String>,
        skew: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                http_client,
                refresh_url: refresh_url.into(),
                skew,
                pending: Mutex::new(None),
            }),
        }
    }

    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    /// Whether a refresh call is currently in flight.
    pub async fn is_refreshing(&self) -> bool {
        self.inner.pending.lock().await.is_some()
    }

    /// Current access token if it is valid for at least the safety margin,
    /// otherwise the result of a refresh.
    ///
    /// Returns `None` without touching the network when no refresh token is
    /// stored.
    pub async fn ensure_access_token(&self) -> Option<String> {
        let store = &self.inner.store;

        if let Some(token) = store.get_access_token().await {
            if !is_expired(&token, self.inner.skew) {
                return Some(token);
            }
            debug!("access token inside refresh margin");
        }

        if store.get_refresh_token().await.is_none() {
            debug!("no refresh token stored, skipping refresh");
            return None;
        }

        self.refresh_access_token()
            .await
            .and_then(|tokens| tokens.access_token)
    }

    /// Refresh the stored pair, joining an in-flight refresh if there is one.
    pub async fn refresh_access_token(&self) -> Option<AuthTokens> {
        let refresh = {
            let mut pending = self.inner.pending.lock().await;
            match pending.as_ref() {
                Some(in_flight) => {
                    debug!("joining in-flight token refresh");
                    in_flight.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let refresh = async move {
                        let outcome = inner.perform_refresh().await;
                        inner.pending.lock().await.take();
                        outcome
                    }
                    .boxed()
                    .shared();
                    *pending = Some(refresh.clone());
                    tokio::spawn(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }
}

impl Inner {
    async fn perform_refresh(&self) -> Option<AuthTokens> {
        let Some(previous_refresh) = self.store.get_refresh_token().await else {
            warn!("refresh requested without a stored refresh token, clearing credentials");
            self.clear_after_failure().await;
            return None;
        };

        match refresh_tokens(&self.http_client, &self.refresh_url, &previous_refresh).await {
            Ok(tokens) => {
                let tokens = AuthTokens {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token.or(Some(previous_refresh)),
                };
                if let Err(e) = self.store.set_tokens(Some(&tokens), None).await {
                    warn!(error = %e, "failed to persist refreshed tokens");
                }
                metrics::counter!("api_token_refresh_total", "outcome" => "success").increment(1);
                info!("access token refreshed");
                Some(tokens)
            }
            Err(e) => {
                metrics::counter!("api_token_refresh_total", "outcome" => "failure").increment(1);
                warn!(error = %e, "token refresh failed, clearing credentials");
                self.clear_after_failure().await;
                None
            }
        }
    }

    async fn clear_after_failure(&self) {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear credentials after refresh failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::net::TcpListener;

    fn jwt(exp_secs: u64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp_secs}}}"#));
        format!("{header}.{payload}.sig")
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[derive(Clone)]
    struct RefreshServer {
        hits: Arc<AtomicUsize>,
        status: StatusCode,
        body: Value,
        delay: Duration,
    }

    /// Start a refresh endpoint that counts hits and answers after `delay`.
    async fn start_refresh_server(
        status: StatusCode,
        body: Value,
        delay: Duration,
    ) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = RefreshServer {
            hits: hits.clone(),
            status,
            body,
            delay,
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route(
                "/api/auth/refresh",
                post(|State(s): State<RefreshServer>| async move {
                    s.hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(s.delay).await;
                    (s.status, Json(s.body.clone()))
                }),
            )
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/api/auth/refresh"), hits)
    }

    async fn store_with(access: Option<String>, refresh: Option<&str>) -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::in_memory());
        store
            .set_tokens(
                Some(&AuthTokens {
                    access_token: access,
                    refresh_token: refresh.map(str::to_owned),
                }),
                None,
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let fresh = jwt(now_secs() + 3600);
        let (url, hits) = start_refresh_server(
            StatusCode::OK,
            json!({"access_token": fresh, "refresh_token": "rt_2"}),
            Duration::from_millis(150),
        )
        .await;
        let store = store_with(Some(jwt(1_000)), Some("rt_1")).await;
        let coordinator = RefreshCoordinator::new(store.clone(), reqwest::Client::new(), url);

        let calls = (0..10).map(|_| {
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_access_token().await }
        });
        let results = futures_util::future::join_all(calls).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one refresh call");
        for result in &results {
            assert_eq!(result.as_deref(), Some(fresh.as_str()));
        }
        assert_eq!(store.get_refresh_token().await.as_deref(), Some("rt_2"));
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn concurrent_callers_on_separate_tasks_share_one_refresh() {
        let fresh = jwt(now_secs() + 3600);
        let (url, hits) = start_refresh_server(
            StatusCode::OK,
            json!({"access_token": fresh}),
            Duration::from_millis(150),
        )
        .await;
        let store = store_with(None, Some("rt_1")).await;
        let coordinator = RefreshCoordinator::new(store, reqwest::Client::new(), url);

        let mut handles = vec![];
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.refresh_access_token().await
            }));
        }
        for h in handles {
            let tokens = h.await.unwrap().unwrap();
            assert_eq!(tokens.access_token.as_deref(), Some(fresh.as_str()));
            // Server omitted refresh_token: previous one is kept
            assert_eq!(tokens.refresh_token.as_deref(), Some("rt_1"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_clears_store_for_every_caller() {
        let (url, hits) = start_refresh_server(
            StatusCode::UNAUTHORIZED,
            json!({"error": "revoked"}),
            Duration::from_millis(100),
        )
        .await;
        let store = store_with(Some(jwt(1_000)), Some("rt_1")).await;
        let coordinator = RefreshCoordinator::new(store.clone(), reqwest::Client::new(), url);

        let calls = (0..5).map(|_| {
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_access_token().await }
        });
        let results = futures_util::future::join_all(calls).await;

        assert!(results.iter().all(Option::is_none));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(store.get_refresh_token().await.is_none());
        assert!(store.get_access_token().await.is_none());
    }

    #[tokio::test]
    async fn settled_refresh_allows_a_new_attempt() {
        let (url, hits) = start_refresh_server(
            StatusCode::OK,
            json!({"access_token": "opaque-at", "refresh_token": "rt_next"}),
            Duration::ZERO,
        )
        .await;
        let store = store_with(None, Some("rt_1")).await;
        let coordinator = RefreshCoordinator::new(store, reqwest::Client::new(), url);

        assert!(coordinator.refresh_access_token().await.is_some());
        assert!(coordinator.refresh_access_token().await.is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed_but_still_readable() {
        let (url, hits) = start_refresh_server(
            StatusCode::OK,
            json!({"access_token": "opaque-new"}),
            Duration::ZERO,
        )
        .await;
        let nearly_expired = jwt(now_secs() + 10);
        let store = store_with(Some(nearly_expired.clone()), Some("rt_1")).await;

        // Direct reads still hand out the token until it is strictly expired
        assert_eq!(store.get_access_token().await, Some(nearly_expired));

        let coordinator = RefreshCoordinator::new(store, reqwest::Client::new(), url);
        assert_eq!(
            coordinator.ensure_access_token().await.as_deref(),
            Some("opaque-new")
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn valid_token_needs_no_network() {
        let (url, hits) = start_refresh_server(StatusCode::OK, json!({}), Duration::ZERO).await;
        let valid = jwt(now_secs() + 3600);
        let store = store_with(Some(valid.clone()), Some("rt_1")).await;
        let coordinator = RefreshCoordinator::new(store, reqwest::Client::new(), url);

        assert_eq!(coordinator.ensure_access_token().await, Some(valid));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_refresh_token_skips_network() {
        let (url, hits) = start_refresh_server(StatusCode::OK, json!({}), Duration::ZERO).await;
        let store = store_with(Some(jwt(1_000)), None).await;
        let coordinator = RefreshCoordinator::new(store, reqwest::Client::new(), url);

        assert!(coordinator.ensure_access_token().await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn response_without_access_token_is_a_failure() {
        let (url, _hits) = start_refresh_server(
            StatusCode::OK,
            json!({"success": true, "data": {}}),
            Duration::ZERO,
        )
        .await;
        let store = store_with(None, Some("rt_1")).await;
        let coordinator = RefreshCoordinator::new(store.clone(), reqwest::Client::new(), url);

        assert!(coordinator.refresh_access_token().await.is_none());
        assert!(store.get_refresh_token().await.is_none());
    }
}
