//! Authenticated request pipeline for the dashboard API
//!
//! [`ApiClient`] resolves paths against the API root, attaches the bearer
//! token from `api-auth`, retries once after a token refresh on 401,
//! deduplicates identical reads, and turns every failure into an
//! [`ApiError`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use api_auth::CredentialStore;
//! use api_client::{ApiClient, ClientConfig};
//!
//! let store = Arc::new(CredentialStore::in_memory());
//! let client = ApiClient::builder(ClientConfig::new("https://dash.example.com"), store).build()?;
//! let shipments: serde_json::Value = client.get("/shipments").await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod policy;

pub use cache::ReadCache;
pub use client::{
    ApiClient, ApiClientBuilder, ClientConfig, DEFAULT_READ_CACHE_TTL, DEFAULT_TIMEOUT,
    RequestBody, RequestOptions, normalize_base_url, resolve_url,
};
pub use envelope::unwrap_envelope;
pub use error::{ApiError, INVALID_RESPONSE_CODE, NETWORK_ERROR_CODE, READ_ONLY_CODE};
pub use policy::{AccessPolicy, Role, RolePolicy, Unrestricted};
