//! Authenticated request executor
//!
//! One call to [`ApiClient::request_value`] runs the whole pipeline:
//! 1. Refuse mutating methods up front when the access policy is read-only
//! 2. Attach `Authorization: Bearer ...` unless the caller brought their own
//!    (auth endpoints use the stored token as-is, everything else goes
//!    through `RefreshCoordinator::ensure_access_token`)
//! 3. GETs consult the read cache, then join an identical in-flight read
//! 4. Send; on 401 refresh once and resend once if the request qualifies
//! 5. Normalize non-2xx responses, unwrap success envelopes
//! 6. A successful mutation clears the read cache

use std::sync::Arc;
use std::time::Duration;

use api_auth::{CredentialStore, RefreshCoordinator, is_non_refreshable_path};
use bytes::Bytes;
use futures_util::FutureExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cache::ReadCache;
use crate::envelope::unwrap_envelope;
use crate::error::ApiError;
use crate::metrics;
use crate::policy::{AccessPolicy, Unrestricted};

/// Per-request timeout unless configured otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifetime of cached GET results
pub const DEFAULT_READ_CACHE_TTL: Duration = Duration::from_secs(5);

/// Connection settings for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend origin or API root; normalized to end with `/api`
    pub base_url: String,
    pub timeout: Duration,
    pub read_cache_ttl: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            read_cache_ttl: DEFAULT_READ_CACHE_TTL,
        }
    }
}

/// Request body. Everything but `Stream` can be sent twice.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Serialized as JSON with `application/json` unless a content type is set
    Json(Value),
    /// Sent as-is with `text/plain` unless a content type is set
    Text(String),
    /// Sent as-is
    Bytes(Bytes),
    /// One-shot body; a request carrying one is never retried
    Stream(reqwest::Body),
}

impl RequestBody {
    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream(_))
    }
}

/// Method, headers and body for one request.
#[derive(Debug)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// JSON body from any serializable value.
    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(value)
            .map_err(|e| ApiError::new(format!("serializing request body: {e}"), 0, None))?;
        Ok(self.body(RequestBody::Json(value)))
    }
}

/// Builder for [`ApiClient`].
pub struct ApiClientBuilder {
    config: ClientConfig,
    store: Arc<CredentialStore>,
    policy: Arc<dyn AccessPolicy>,
    http_client: Option<reqwest::Client>,
}

impl ApiClientBuilder {
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Use a preconfigured reqwest client instead of the default one
    /// (cookie store enabled).
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(self) -> Result<ApiClient, reqwest::Error> {
        let http = match self.http_client {
            Some(client) => client,
            None => reqwest::Client::builder().cookie_store(true).build()?,
        };
        let base_url = normalize_base_url(&self.config.base_url);
        let refresher = RefreshCoordinator::new(
            self.store.clone(),
            http.clone(),
            format!("{base_url}{}", api_auth::REFRESH_PATH),
        );
        info!(base_url = %base_url, "api client ready");

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                timeout: self.config.timeout,
                store: self.store,
                refresher,
                policy: self.policy,
                reads: ReadCache::new(self.config.read_cache_ttl),
            }),
        })
    }
}

/// Authenticated client for the dashboard API. Cheap to clone.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    store: Arc<CredentialStore>,
    refresher: RefreshCoordinator,
    policy: Arc<dyn AccessPolicy>,
    reads: ReadCache,
}

/// A request after authorization has been resolved.
struct PreparedCall {
    method: Method,
    url: String,
    path: String,
    headers: HeaderMap,
    body: RequestBody,
    caller_authorized: bool,
}

impl ApiClient {
    pub fn builder(config: ClientConfig, store: Arc<CredentialStore>) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            store,
            policy: Arc::new(Unrestricted),
            http_client: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.inner.refresher
    }

    /// Absolute URL for `path`; absolute URLs pass through unchanged.
    pub fn resolve_url(&self, path: &str) -> String {
        resolve_url(&self.inner.base_url, path)
    }

    pub async fn clear_read_cache(&self) {
        self.inner.reads.clear().await;
    }

    /// Forget the stored credentials and every cached read.
    pub async fn logout(&self) -> api_auth::Result<()> {
        self.inner.reads.clear().await;
        self.inner.store.clear().await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(path, RequestOptions::new(Method::GET)).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.request(path, RequestOptions::new(Method::POST).body(RequestBody::Json(body)))
            .await
    }

    pub async fn put<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.request(path, RequestOptions::new(Method::PUT).body(RequestBody::Json(body)))
            .await
    }

    pub async fn patch<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.request(path, RequestOptions::new(Method::PATCH).body(RequestBody::Json(body)))
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(path, RequestOptions::new(Method::DELETE)).await
    }

    /// Run the pipeline and deserialize the unwrapped payload into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let value = self.request_value(path, options).await?;
        serde_json::from_value(value).map_err(ApiError::invalid_response)
    }

    /// Run the pipeline and return the unwrapped JSON payload.
    ///
    /// Text responses come back as `Value::String`, empty ones as `Value::Null`.
    #[instrument(
        skip_all,
        fields(request_id = %uuid::Uuid::new_v4(), method = %options.method, path = %path)
    )]
    pub async fn request_value(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let RequestOptions {
            method,
            mut headers,
            body,
        } = options;

        if is_mutating(&method) && !self.inner.policy.allows_mutation() {
            warn!("mutating request blocked for read-only session");
            return Err(ApiError::read_only());
        }

        let caller_authorized = headers.contains_key(AUTHORIZATION);
        if !caller_authorized {
            let token = if is_non_refreshable_path(path) {
                self.inner.store.get_access_token().await
            } else {
                self.inner.refresher.ensure_access_token().await
            };
            if let Some(value) = token.as_deref().and_then(bearer_header) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        let call = PreparedCall {
            url: self.resolve_url(path),
            path: path.to_owned(),
            method,
            headers,
            body,
            caller_authorized,
        };

        if call.method == Method::GET {
            return self.dedupe_read(call).await;
        }

        let mutating = is_mutating(&call.method);
        let result = self.inner.execute(call).await;
        if mutating && result.is_ok() {
            self.inner.reads.clear().await;
        }
        result
    }

    async fn dedupe_read(&self, call: PreparedCall) -> Result<Value, ApiError> {
        let authorization = call
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let key = ReadCache::key(&call.url, authorization);

        if let Some(value) = self.inner.reads.get(&key).await {
            debug!("read served from cache");
            metrics::record_read_cache("hit");
            return Ok(value);
        }

        let inner = self.inner.clone();
        let settle_key = key.clone();
        let (pending, joined) = self
            .inner
            .reads
            .join_or_register(&key, move || {
                async move {
                    let result = inner.execute(call).await;
                    inner.reads.settle(&settle_key, &result).await;
                    result
                }
                .boxed()
                .shared()
            })
            .await;

        if joined {
            debug!("joined in-flight read");
            metrics::record_read_cache("joined");
        } else {
            metrics::record_read_cache("miss");
            // Drive the read to settlement even if every caller goes away
            tokio::spawn(pending.clone());
        }

        pending.await
    }
}

impl ClientInner {
    async fn execute(&self, call: PreparedCall) -> Result<Value, ApiError> {
        let PreparedCall {
            method,
            url,
            path,
            mut headers,
            body,
            caller_authorized,
        } = call;

        let replayable = body.is_replayable();
        let mut body = OutgoingBody::prepare(body, &mut headers)?;

        let mut response = self.send(&method, &url, &headers, &mut body).await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && !caller_authorized
            && replayable
            && method != Method::OPTIONS
            && !is_non_refreshable_path(&path)
            && self.store.get_refresh_token().await.is_some()
        {
            debug!("401 received, refreshing access token once");
            let refreshed = self
                .refresher
                .refresh_access_token()
                .await
                .and_then(|tokens| tokens.access_token);
            if let Some(value) = refreshed.as_deref().and_then(bearer_header) {
                headers.insert(AUTHORIZATION, value);
                response = self.send(&method, &url, &headers, &mut body).await?;
                info!(status = response.status().as_u16(), "retried request after token refresh");
            }
        }

        let status = response.status();
        metrics::record_request(method.as_str(), status.as_u16());
        let payload = read_payload(response).await?;

        if !status.is_success() {
            let err = ApiError::normalize(
                &payload,
                status.as_u16(),
                status.canonical_reason().unwrap_or_default(),
            );
            warn!(status = status.as_u16(), code = ?err.code(), "request failed");
            return Err(err);
        }

        unwrap_envelope(payload)
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: &mut OutgoingBody,
    ) -> Result<reqwest::Response, ApiError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .headers(headers.clone())
            .timeout(self.timeout);
        if let Some(body) = body.next() {
            request = request.body(body);
        }

        request.send().await.map_err(|e| {
            metrics::record_transport_error(method.as_str());
            warn!(error = %e, "request failed before a response arrived");
            ApiError::transport(e)
        })
    }
}

/// Body ready for sending; replayable variants hand out a fresh copy per send.
enum OutgoingBody {
    Empty,
    Replayable(Bytes),
    OneShot(Option<reqwest::Body>),
}

impl OutgoingBody {
    fn prepare(body: RequestBody, headers: &mut HeaderMap) -> Result<Self, ApiError> {
        let default_type = |headers: &mut HeaderMap, value: &'static str| {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(value));
            }
        };

        Ok(match body {
            RequestBody::Empty => OutgoingBody::Empty,
            RequestBody::Json(value) => {
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| ApiError::new(format!("serializing request body: {e}"), 0, None))?;
                default_type(headers, "application/json");
                OutgoingBody::Replayable(Bytes::from(bytes))
            }
            RequestBody::Text(text) => {
                default_type(headers, "text/plain; charset=utf-8");
                OutgoingBody::Replayable(Bytes::from(text))
            }
            RequestBody::Bytes(bytes) => OutgoingBody::Replayable(bytes),
            RequestBody::Stream(body) => OutgoingBody::OneShot(Some(body)),
        })
    }

    fn next(&mut self) -> Option<reqwest::Body> {
        match self {
            OutgoingBody::Empty => None,
            OutgoingBody::Replayable(bytes) => Some(reqwest::Body::from(bytes.clone())),
            OutgoingBody::OneShot(body) => body.take(),
        }
    }
}

/// Decode the response body: JSON by content type, text otherwise, `Null`
/// for 204 and empty bodies.
async fn read_payload(response: reqwest::Response) -> Result<Value, ApiError> {
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }

    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));

    let bytes = response.bytes().await.map_err(ApiError::transport)?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }

    if is_json {
        if let Ok(value) = serde_json::from_slice(&bytes) {
            return Ok(value);
        }
        debug!("response declared JSON but did not parse, keeping text");
    }
    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

fn bearer_header(token: &str) -> Option<HeaderValue> {
    match HeaderValue::from_str(&format!("Bearer {token}")) {
        Ok(mut value) => {
            value.set_sensitive(true);
            Some(value)
        }
        Err(e) => {
            warn!(error = %e, "access token is not a valid header value");
            None
        }
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Trim trailing slashes and make sure the base ends with `/api`.
pub fn normalize_base_url(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed
        .to_ascii_lowercase()
        .ends_with(api_auth::API_PATH_SEGMENT)
    {
        trimmed.to_owned()
    } else {
        format!("{trimmed}{}", api_auth::API_PATH_SEGMENT)
    }
}

/// Join `path` onto a normalized base. Absolute URLs pass through unchanged.
pub fn resolve_url(base: &str, path: &str) -> String {
    let lower = path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return path.to_owned();
    }
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{path}")
    }
}
