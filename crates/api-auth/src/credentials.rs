//! Credential store for the access/refresh token pair
//!
//! Tokens live in one of two scopes: persistent (survives restarts) or
//! session (process lifetime). The storage-mode marker, kept in the
//! persistent scope, says which scope is authoritative. Reads look in the
//! authoritative scope first, then the other scope, then the legacy key
//! names, and move whatever they find up into the canonical key of the
//! authoritative scope.
//!
//! Writes always replace the whole pair. A tokio Mutex serializes every
//! operation, so a read-triggered migration can never interleave with a
//! refresh writing a new pair.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::claims::is_expired;
use crate::constants::{
    ACCESS_TOKEN_KEY, LEGACY_ACCESS_TOKEN_KEYS, LEGACY_REFRESH_TOKEN_KEYS, REFRESH_TOKEN_KEY,
    STORAGE_MODE_KEY,
};
use crate::error::Result;
use crate::storage::{MemoryStorage, Storage};

/// Access/refresh token pair. Either side may be missing.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl AuthTokens {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token,
        }
    }

    /// Trim both tokens and drop blank ones.
    pub fn normalized(self) -> Self {
        Self {
            access_token: self.access_token.as_deref().and_then(normalize),
            refresh_token: self.refresh_token.as_deref().and_then(normalize),
        }
    }
}

impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |t: &Option<String>| t.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("AuthTokens")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

/// Which scope is authoritative for the stored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStorageMode {
    Persistent,
    Session,
}

impl TokenStorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenStorageMode::Persistent => "persistent",
            TokenStorageMode::Session => "session",
        }
    }

    fn other(self) -> Self {
        match self {
            TokenStorageMode::Persistent => TokenStorageMode::Session,
            TokenStorageMode::Session => TokenStorageMode::Persistent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn key(self) -> &'static str {
        match self {
            TokenKind::Access => ACCESS_TOKEN_KEY,
            TokenKind::Refresh => REFRESH_TOKEN_KEY,
        }
    }

    fn legacy_keys(self) -> &'static [&'static str] {
        match self {
            TokenKind::Access => LEGACY_ACCESS_TOKEN_KEYS,
            TokenKind::Refresh => LEGACY_REFRESH_TOKEN_KEYS,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// Dual-scope credential store.
pub struct CredentialStore {
    persistent: Arc<dyn Storage>,
    session: Arc<dyn Storage>,
    op_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(persistent: Arc<dyn Storage>, session: Arc<dyn Storage>) -> Self {
        Self {
            persistent,
            session,
            op_lock: Mutex::new(()),
        }
    }

    /// Store with both scopes in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryStorage::new()))
    }

    /// Currently authoritative scope. Defaults to persistent when no marker
    /// has been written yet.
    pub async fn storage_mode(&self) -> TokenStorageMode {
        let _guard = self.op_lock.lock().await;
        self.resolve_mode().await
    }

    /// Stored access token, if present and not past its expiry claim.
    pub async fn get_access_token(&self) -> Option<String> {
        self.read_token(TokenKind::Access).await
    }

    /// Stored refresh token, if present and not past its expiry claim.
    pub async fn get_refresh_token(&self) -> Option<String> {
        self.read_token(TokenKind::Refresh).await
    }

    /// Both tokens as currently readable.
    pub async fn tokens(&self) -> AuthTokens {
        AuthTokens {
            access_token: self.get_access_token().await,
            refresh_token: self.get_refresh_token().await,
        }
    }

    /// Replace the stored pair, or clear everything when `tokens` is `None`.
    ///
    /// `persist` picks the scope explicitly; `None` keeps whichever scope is
    /// already authoritative. The other scope's tokens and all legacy keys
    /// are removed on every write.
    pub async fn set_tokens(
        &self,
        tokens: Option<&AuthTokens>,
        persist: Option<bool>,
    ) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let Some(tokens) = tokens else {
            return self.clear_all().await;
        };

        let mode = match persist {
            Some(true) => TokenStorageMode::Persistent,
            Some(false) => TokenStorageMode::Session,
            None => self.resolve_mode().await,
        };
        let tokens = tokens.clone().normalized();
        let target = self.scope(mode);

        write_or_remove(target, ACCESS_TOKEN_KEY, tokens.access_token.as_deref()).await?;
        write_or_remove(target, REFRESH_TOKEN_KEY, tokens.refresh_token.as_deref()).await?;
        self.scope(mode.other())
            .remove(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY])
            .await?;
        self.persistent.set(STORAGE_MODE_KEY, mode.as_str()).await?;

        for scope in [&self.persistent, &self.session] {
            scope.remove(LEGACY_ACCESS_TOKEN_KEYS).await?;
            scope.remove(LEGACY_REFRESH_TOKEN_KEYS).await?;
        }

        debug!(
            mode = mode.as_str(),
            has_access = tokens.access_token.is_some(),
            has_refresh = tokens.refresh_token.is_some(),
            "stored credentials"
        );
        Ok(())
    }

    /// Remove both tokens, the mode marker and every legacy key from both scopes.
    pub async fn clear(&self) -> Result<()> {
        self.set_tokens(None, None).await
    }

    async fn clear_all(&self) -> Result<()> {
        let mut keys = vec![ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, STORAGE_MODE_KEY];
        keys.extend_from_slice(LEGACY_ACCESS_TOKEN_KEYS);
        keys.extend_from_slice(LEGACY_REFRESH_TOKEN_KEYS);

        self.persistent.remove(&keys).await?;
        self.session.remove(&keys).await?;
        info!("cleared stored credentials");
        Ok(())
    }

    fn scope(&self, mode: TokenStorageMode) -> &Arc<dyn Storage> {
        match mode {
            TokenStorageMode::Persistent => &self.persistent,
            TokenStorageMode::Session => &self.session,
        }
    }

    async fn resolve_mode(&self) -> TokenStorageMode {
        match read_raw(self.persistent.as_ref(), STORAGE_MODE_KEY).await.as_deref() {
            Some("session") => TokenStorageMode::Session,
            _ => TokenStorageMode::Persistent,
        }
    }

    async fn read_token(&self, kind: TokenKind) -> Option<String> {
        let _guard = self.op_lock.lock().await;
        let mode = self.resolve_mode().await;
        let key = kind.key();
        let primary = self.scope(mode);

        if let Some(token) = take_valid(primary.as_ref(), key).await {
            return Some(token);
        }

        let fallback = self.scope(mode.other());
        if let Some(token) = take_valid(fallback.as_ref(), key).await {
            migrate(primary.as_ref(), fallback.as_ref(), key, key, &token).await;
            debug!(
                kind = kind.label(),
                mode = mode.as_str(),
                "moved token into authoritative scope"
            );
            return Some(token);
        }

        for source in [primary, fallback] {
            for legacy in kind.legacy_keys() {
                if let Some(token) = take_valid(source.as_ref(), legacy).await {
                    migrate(primary.as_ref(), source.as_ref(), legacy, key, &token).await;
                    info!(
                        kind = kind.label(),
                        legacy_key = *legacy,
                        mode = mode.as_str(),
                        "migrated legacy credential key"
                    );
                    return Some(token);
                }
            }
        }

        None
    }
}

fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

async fn read_raw(scope: &dyn Storage, key: &str) -> Option<String> {
    match scope.get(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "credential storage read failed, treating as absent");
            None
        }
    }
}

/// Normalized, unexpired value under `key`. Expired values are purged.
async fn take_valid(scope: &dyn Storage, key: &str) -> Option<String> {
    let token = normalize(&read_raw(scope, key).await?)?;
    if is_expired(&token, Duration::ZERO) {
        debug!(key, "purging expired token");
        if let Err(e) = scope.remove(&[key]).await {
            warn!(key, error = %e, "failed to purge expired token");
        }
        return None;
    }
    Some(token)
}

async fn migrate(target: &dyn Storage, source: &dyn Storage, from: &str, to: &str, token: &str) {
    if let Err(e) = target.set(to, token).await {
        warn!(key = to, error = %e, "failed to write migrated token");
        return;
    }
    if let Err(e) = source.remove(&[from]).await {
        warn!(key = from, error = %e, "failed to remove migrated key");
    }
}

async fn write_or_remove(scope: &Arc<dyn Storage>, key: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => scope.set(key, value).await,
        None => scope.remove(&[key]).await,
    }
}
