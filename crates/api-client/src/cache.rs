//! Short-lived read cache and in-flight read registry
//!
//! Both maps are keyed by the normalized request URL plus the Authorization
//! value the request went out with, so two identities never share an entry.
//! A registry entry exists only while its request is unsettled; the request
//! future removes it on settlement and, on success only, fills the TTL cache.
//!
//! Invalidation is coarse: any successful mutation clears the whole cache.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ApiError;

/// Pending read shared by every caller with the same key.
pub type SharedRead = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

struct CachedEntry {
    value: Value,
    expires_at: Instant,
}

pub struct ReadCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedEntry>>,
    in_flight: Mutex<HashMap<String, SharedRead>>,
}

impl ReadCache {
    /// A zero `ttl` disables caching; concurrent reads are still deduplicated.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Cache/registry key for a read of `url` sent with `authorization`.
    pub fn key(url: &str, authorization: Option<&str>) -> String {
        let normalized = reqwest::Url::parse(url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.to_owned());
        format!("{normalized}\n{}", authorization.unwrap_or_default())
    }

    /// Cached value for `key`. Expired entries are evicted here.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get(key)?;
        if entry.expires_at > Instant::now() {
            return Some(entry.value.clone());
        }
        entries.remove(key);
        debug!("evicted expired read cache entry");
        None
    }

    pub async fn insert(&self, key: String, value: Value) {
        if self.ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .lock()
            .await
            .insert(key, CachedEntry { value, expires_at });
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        if !entries.is_empty() {
            debug!(entries = entries.len(), "cleared read cache");
        }
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Join the pending read for `key`, or register the one built by `start`.
    ///
    /// Returns the shared handle and whether it was already in flight.
    pub async fn join_or_register(
        &self,
        key: &str,
        start: impl FnOnce() -> SharedRead,
    ) -> (SharedRead, bool) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(pending) = in_flight.get(key) {
            return (pending.clone(), true);
        }
        let pending = start();
        in_flight.insert(key.to_owned(), pending.clone());
        (pending, false)
    }

    /// Number of reads currently in flight.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Called by the read future once it has a result.
    ///
    /// A successful value lands in the cache before the registry entry goes
    /// away, so an identical read always finds one of the two.
    pub async fn settle(&self, key: &str, result: &Result<Value, ApiError>) {
        if let Ok(value) = result {
            self.insert(key.to_owned(), value.clone()).await;
        }
        self.in_flight.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn key_separates_identities_and_normalizes_url() {
        let a = ReadCache::key("http://Example.com/api/items", Some("Bearer a"));
        let b = ReadCache::key("http://example.com/api/items", Some("Bearer b"));
        assert_ne!(a, b);
        assert_eq!(a, ReadCache::key("http://example.com/api/items", Some("Bearer a")));
        assert_ne!(
            ReadCache::key("http://example.com/api/items", None),
            ReadCache::key("http://example.com/api/items", Some("Bearer a"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = ReadCache::new(Duration::from_secs(5));
        cache.insert("k".into(), json!(1)).await;
        assert_eq!(cache.get("k").await, Some(json!(1)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("k").await.is_none());
        assert!(cache.is_empty().await, "expired entry is evicted on read");
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let cache = ReadCache::new(Duration::ZERO);
        cache.insert("k".into(), json!(1)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn settle_removes_registry_entry_and_caches_success_only() {
        let cache = ReadCache::new(Duration::from_secs(5));
        let start = || -> SharedRead { async { Ok(json!("v")) }.boxed().shared() };

        let (_, joined) = cache.join_or_register("ok", start).await;
        assert!(!joined);
        let (_, joined) = cache.join_or_register("ok", start).await;
        assert!(joined);
        assert_eq!(cache.in_flight().await, 1);

        cache.settle("ok", &Ok(json!("v"))).await;
        assert_eq!(cache.in_flight().await, 0);
        assert_eq!(cache.get("ok").await, Some(json!("v")));

        cache.join_or_register("err", start).await;
        cache
            .settle("err", &Err(ApiError::new("boom", 500, None)))
            .await;
        assert_eq!(cache.in_flight().await, 0);
        assert!(cache.get("err").await.is_none());
    }

    #[tokio::test]
    async fn registry_entry_outlives_cache_insert() {
        let cache = Arc::new(ReadCache::new(Duration::from_secs(5)));
        cache
            .join_or_register("k", || -> SharedRead { async { Ok(json!("v")) }.boxed().shared() })
            .await;

        // Hold the cache map so settle stalls on its insert
        let entries = cache.entries.lock().await;
        let settling = tokio::spawn({
            let cache = cache.clone();
            async move { cache.settle("k", &Ok(json!("v"))).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.in_flight().await, 1, "read must stay joinable until cached");

        drop(entries);
        settling.await.unwrap();
        assert_eq!(cache.in_flight().await, 0);
        assert_eq!(cache.get("k").await, Some(json!("v")));
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let cache = ReadCache::new(Duration::from_secs(5));
        cache.insert("a".into(), json!(1)).await;
        cache.insert("b".into(), json!(2)).await;
        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
