//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens are only ever read from API_ACCESS_TOKEN / API_REFRESH_TOKEN,
//! never from the TOML file.

use api_client::Role;
use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Access token seeded from API_ACCESS_TOKEN
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
    /// Refresh token seeded from API_REFRESH_TOKEN
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
}

/// Backend connection settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_read_cache_ttl")]
    pub read_cache_ttl_ms: u64,
}

/// Where credentials live between runs
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    /// Seeded tokens go to the persistent scope when true, the in-process
    /// session scope otherwise
    #[serde(default = "default_persist")]
    pub persist: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            persist: default_persist(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_role")]
    pub role: Role,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
        }
    }
}

fn default_timeout() -> u64 {
    api_client::DEFAULT_TIMEOUT.as_secs()
}

fn default_read_cache_ttl() -> u64 {
    api_client::DEFAULT_READ_CACHE_TTL.as_millis() as u64
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("api-probe-credentials.json")
}

fn default_persist() -> bool {
    true
}

fn default_role() -> Role {
    Role::Editor
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Some(base_url) = std::env::var("API_BASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
        {
            config.api.base_url = base_url.trim().to_owned();
        }

        if !config.api.base_url.starts_with("http://")
            && !config.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.api.base_url
            )));
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        config.access_token = Secret::from_env("API_ACCESS_TOKEN");
        config.refresh_token = Secret::from_env("API_REFRESH_TOKEN");

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("api-probe.toml")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn read_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.api.read_cache_ttl_ms)
    }
}
