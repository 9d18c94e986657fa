//! Key/value backends for the two credential scopes
//!
//! `FileStorage` backs the persistent scope: a JSON object on disk, written
//! atomically (temp file + rename) with owner-only permissions. `MemoryStorage`
//! backs the session scope and lives as long as the process.
//!
//! Both keep their state in memory behind a tokio Mutex, so reads never touch
//! the disk after load.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future returned by [`Storage`] methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A single credential scope.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Storage>`).
pub trait Storage: Send + Sync {
    /// Raw stored value for `key`, if any.
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()>;

    /// Remove every key in `keys`. Missing keys are ignored.
    fn remove<'a>(&'a self, keys: &'a [&'a str]) -> StorageFuture<'a, ()>;
}

/// Session scope: values held in memory only.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Storage for MemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .insert(key.to_owned(), value.to_owned());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, keys: &'a [&'a str]) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            for key in keys {
                state.remove(*key);
            }
            Ok(())
        })
    }
}

/// Persistent scope: a JSON object file mapping keys to strings.
pub struct FileStorage {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Load the store from `path`.
    ///
    /// If the file doesn't exist, creates it as `{}` so later loads skip the
    /// cold-start path.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let values: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), keys = values.len(), "loaded credential file");
            values
        } else {
            info!(path = %path.display(), "credential file not found, starting empty");
            let values = HashMap::new();
            write_atomic(&path, &values).await?;
            values
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.get(key).map(String::as_str) == Some(value) {
                return Ok(());
            }
            state.insert(key.to_owned(), value.to_owned());
            write_atomic(&self.path, &state).await
        })
    }

    fn remove<'a>(&'a self, keys: &'a [&'a str]) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut changed = false;
            for key in keys {
                changed |= state.remove(*key).is_some();
            }
            if changed {
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// Write the key/value map atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets permissions to 0600 since the file holds bearer tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential file");
    Ok(())
}
