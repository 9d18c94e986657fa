//! Dashboard API probe
//!
//! Small operator CLI over the authenticated request pipeline:
//! 1. Loads config and seeds tokens from API_ACCESS_TOKEN / API_REFRESH_TOKEN
//! 2. Keeps credentials in a file-backed persistent scope between runs
//! 3. Issues one request and prints the unwrapped payload as JSON

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use api_auth::{
    ACCESS_TOKEN_SKEW, AuthTokens, CredentialStore, FileStorage, MemoryStorage,
    expires_at_millis, is_expired,
};
use api_client::{ApiClient, ApiError, ClientConfig, RequestBody, RequestOptions, RolePolicy};
use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "api-probe", version, about = "Authenticated dashboard API probe")]
struct Cli {
    /// Config file (falls back to CONFIG_PATH, then ./api-probe.toml)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// GET a path and print the payload
    Get { path: String },
    /// Send a request with any method
    Send {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        json: Option<String>,
    },
    /// Show which tokens are stored and when the access token expires
    Status,
    /// Forget stored credentials
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        timeout_secs = config.api.timeout_secs,
        read_cache_ttl_ms = config.api.read_cache_ttl_ms,
        credentials_path = %config.storage.credentials_path.display(),
        role = ?config.session.role,
        "configuration loaded"
    );

    let persistent = FileStorage::load(config.storage.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open credentials file {}",
                config.storage.credentials_path.display()
            )
        })?;
    let store = Arc::new(CredentialStore::new(
        Arc::new(persistent),
        Arc::new(MemoryStorage::new()),
    ));
    seed_tokens(&store, &config).await?;

    let client = ApiClient::builder(
        ClientConfig {
            base_url: config.api.base_url.clone(),
            timeout: config.timeout(),
            read_cache_ttl: config.read_cache_ttl(),
        },
        store.clone(),
    )
    .policy(Arc::new(RolePolicy::new(config.session.role)))
    .build()
    .context("failed to build HTTP client")?;

    match cli.command {
        Command::Get { path } => {
            let result = client
                .request_value(&path, RequestOptions::new(Method::GET))
                .await;
            print_outcome(result)
        }
        Command::Send { method, path, json } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method: {method}"))?;
            let mut options = RequestOptions::new(method);
            if let Some(body) = json {
                let body: Value = serde_json::from_str(&body).context("--json is not valid JSON")?;
                options = options.body(RequestBody::Json(body));
            }
            print_outcome(client.request_value(&path, options).await)
        }
        Command::Status => {
            let status = session_status(&store, client.base_url()).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Logout => {
            client.logout().await.context("failed to clear credentials")?;
            info!("credentials cleared");
            Ok(())
        }
    }
}

/// Replace stored tokens with the ones given in the environment, if any.
async fn seed_tokens(store: &CredentialStore, config: &Config) -> Result<()> {
    if config.access_token.is_none() && config.refresh_token.is_none() {
        return Ok(());
    }
    if config.access_token.is_none() {
        warn!("API_REFRESH_TOKEN set without API_ACCESS_TOKEN; the first request will refresh");
    }

    let tokens = AuthTokens {
        access_token: config.access_token.as_ref().map(|s| s.expose_str().to_owned()),
        refresh_token: config.refresh_token.as_ref().map(|s| s.expose_str().to_owned()),
    };
    store
        .set_tokens(Some(&tokens), Some(config.storage.persist))
        .await
        .context("failed to seed tokens from the environment")?;
    info!(persist = config.storage.persist, "seeded tokens from environment");
    Ok(())
}

async fn session_status(store: &CredentialStore, base_url: &str) -> Value {
    let mode = store.storage_mode().await;
    let tokens = store.tokens().await;
    let access = tokens.access_token.as_deref();

    json!({
        "base_url": base_url,
        "storage_mode": mode.as_str(),
        "access_token": access.is_some(),
        "access_token_expires_at_ms": access.and_then(expires_at_millis),
        "access_token_needs_refresh": access.is_some_and(|t| is_expired(t, ACCESS_TOKEN_SKEW)),
        "refresh_token": tokens.refresh_token.is_some(),
    })
}

/// Print the payload, or the normalized error, as JSON.
fn print_outcome(result: std::result::Result<Value, ApiError>) -> Result<()> {
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", serde_json::to_string_pretty(&json!({ "error": &err }))?);
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_parses_method_path_and_body() {
        let cli = Cli::parse_from([
            "api-probe",
            "--config",
            "/etc/probe.toml",
            "send",
            "patch",
            "/shipments/7",
            "--json",
            r#"{"status":"delivered"}"#,
        ]);
        assert_eq!(cli.config.as_deref(), Some("/etc/probe.toml"));
        match cli.command {
            Command::Send { method, path, json } => {
                assert_eq!(method, "patch");
                assert_eq!(path, "/shipments/7");
                assert_eq!(json.as_deref(), Some(r#"{"status":"delivered"}"#));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_reports_token_presence_without_values() {
        let store = CredentialStore::in_memory();
        store
            .set_tokens(Some(&AuthTokens::new("opaque-token", Some("rt".into()))), Some(false))
            .await
            .unwrap();

        let status = session_status(&store, "https://dash.example.com/api").await;
        assert_eq!(status["storage_mode"], "session");
        assert_eq!(status["access_token"], true);
        assert_eq!(status["access_token_expires_at_ms"], Value::Null);
        assert_eq!(status["access_token_needs_refresh"], false);
        assert_eq!(status["refresh_token"], true);
        assert!(!status.to_string().contains("opaque-token"));
    }

    #[tokio::test]
    async fn empty_store_reports_nothing() {
        let store = CredentialStore::in_memory();
        let status = session_status(&store, "https://dash.example.com/api").await;
        assert_eq!(status["storage_mode"], "persistent");
        assert_eq!(status["access_token"], false);
        assert_eq!(status["refresh_token"], false);
    }
}
