//! `wxoa` CLI entry point.
//!
//! `start` runs the webhook adapter until Ctrl-C. `refresh`, `message` and
//! `contact` are one-shot helpers against the same config and cache.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use wxoa::account::OfficialAccount;
use wxoa::config;
use wxoa::credentials::{CredentialManager, HttpTokenEndpoint, RefreshOutcome};
use wxoa::store::PayloadStore;

/// WeChat Official Account webhook adapter.
#[derive(Parser)]
#[command(name = "wxoa", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Serve the webhook and keep the access token fresh.
    Start,
    /// Refresh the access token once and print its expiry.
    Refresh,
    /// Print a cached message payload as JSON.
    Message {
        /// Platform message id.
        id: String,
    },
    /// Print a cached contact payload as JSON.
    Contact {
        /// Contact `openid`.
        openid: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing .env is fine; the file only supplements the environment.
    let _ = dotenvy::dotenv();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Refresh => handle_refresh().await,
        Command::Message { id } => handle_message(&id).await,
        Command::Contact { openid } => handle_contact(&openid).await,
    }
}

/// Run the adapter until Ctrl-C.
async fn handle_start() -> anyhow::Result<()> {
    let logs_dir = config::config_dir()?.join("logs");
    let _logging_guard = wxoa::logging::init_production(&logs_dir)?;

    let settings = config::load_settings().context("invalid configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        app_id = %settings.app_id,
        port = settings.port,
        "wxoa starting"
    );

    let mut account = OfficialAccount::open(settings)
        .await
        .context("failed to open payload store")?;

    if let Err(e) = account.start().await {
        account.stop().await.ok();
        return Err(e).context("failed to start official account");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    account.stop().await.context("unclean shutdown")?;
    Ok(())
}

/// Refresh once and report the outcome.
async fn handle_refresh() -> anyhow::Result<()> {
    wxoa::logging::init_cli();

    let settings = config::load_settings().context("invalid configuration")?;
    let store = PayloadStore::open(&settings.cache_dir)
        .await
        .context("failed to open payload store")?;
    let endpoint = HttpTokenEndpoint::new(settings.api_base_url.clone(), settings.request_timeout);
    let manager = CredentialManager::new(
        settings.app_id.clone(),
        settings.app_secret.clone(),
        store.clone(),
        std::sync::Arc::new(endpoint),
    );

    let result = manager.refresh().await;
    store.close().await;

    match result.context("access token refresh failed")? {
        RefreshOutcome::Cached { expires_at } => {
            println!("cached token still fresh, expires at {expires_at}");
        }
        RefreshOutcome::Fetched {
            expires_at,
            ttl_seconds,
        } => {
            println!("fetched new token, expires at {expires_at} (ttl {ttl_seconds}s)");
        }
    }
    Ok(())
}

/// Print a stored message payload.
async fn handle_message(id: &str) -> anyhow::Result<()> {
    wxoa::logging::init_cli();
    let store = open_cache().await?;
    let result = store.get_message(id).await;
    store.close().await;
    let message = result.with_context(|| format!("message {id} not available"))?;
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}

/// Print a stored contact payload.
async fn handle_contact(openid: &str) -> anyhow::Result<()> {
    wxoa::logging::init_cli();
    let store = open_cache().await?;
    let result = store.get_contact(openid).await;
    store.close().await;
    let contact = result.with_context(|| format!("contact {openid} not available"))?;
    println!("{}", serde_json::to_string_pretty(&contact)?);
    Ok(())
}

/// Open the cache without requiring account credentials.
async fn open_cache() -> anyhow::Result<PayloadStore> {
    let config = config::load_unvalidated().context("invalid configuration")?;
    let cache_dir = config.cache_dir()?;
    if !cache_dir.exists() {
        warn!(dir = %cache_dir.display(), "cache directory does not exist yet");
    }
    PayloadStore::open(&cache_dir)
        .await
        .with_context(|| format!("failed to open cache at {}", cache_dir.display()))
}
