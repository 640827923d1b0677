//! Configuration loading and validation.
//!
//! Settings come from `config.toml` (path `$WXOA_CONFIG_PATH` or
//! `~/.wxoa/config.toml`) with environment overrides on top.
//!
//! Precedence: env vars > config file > defaults.
//!
//! The application id, application secret, verification token and listen
//! port are required. [`Config::validate`] turns a loaded [`Config`] into
//! [`Settings`] or fails with [`ConfigError`] before anything starts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::credentials::{
    DEFAULT_API_BASE_URL, DEFAULT_REFRESH_INTERVAL_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::types::MessageType;
use crate::webhook::{WebhookOptions, DEFAULT_DISPATCH_TYPES};

/// Env var naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "WXOA_CONFIG_PATH";
/// Env var overriding `account.app_id`.
pub const APP_ID_ENV: &str = "WXOA_APP_ID";
/// Env var overriding `account.app_secret`.
pub const APP_SECRET_ENV: &str = "WXOA_APP_SECRET";
/// Env var overriding `account.token`.
pub const TOKEN_ENV: &str = "WXOA_TOKEN";
/// Env var overriding `webhook.port`.
pub const PORT_ENV: &str = "WXOA_PORT";
/// Env var overriding `store.cache_dir`.
pub const CACHE_DIR_ENV: &str = "WXOA_CACHE_DIR";
/// Env var overriding `credentials.api_base_url`.
pub const API_BASE_URL_ENV: &str = "WXOA_API_BASE_URL";

/// Fatal configuration problems. Any of these prevents startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent or empty.
    #[error("missing required setting `{field}` (set it in config.toml or via {env})")]
    Missing {
        /// Dotted config key.
        field: &'static str,
        /// Environment variable that can supply it.
        env: &'static str,
    },

    /// A setting has an unusable value.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Dotted config key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The config file exists but could not be read.
    #[error("failed to read config at {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`Config`].
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Parser error.
        source: toml::de::Error,
    },

    /// The home directory could not be determined.
    #[error("cannot determine home directory")]
    HomeDir,
}

// ── File schema ─────────────────────────────────────────────────

/// Top-level configuration as read from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Official Account identity.
    pub account: AccountConfig,
    /// Webhook listener.
    pub webhook: WebhookConfig,
    /// Access-token refresh.
    pub credentials: CredentialsConfig,
    /// Payload cache.
    pub store: StoreConfig,
}

/// Official Account identity and secrets.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Application id (`appid`).
    pub app_id: Option<String>,
    /// Application secret.
    pub app_secret: Option<String>,
    /// Verification token shared with the platform.
    pub token: Option<String>,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("app_id", &self.app_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[REDACTED]"))
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Webhook listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind. Required.
    pub port: Option<u16>,
    /// Message kinds dispatched to handlers.
    pub dispatch_types: Vec<MessageType>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            dispatch_types: DEFAULT_DISPATCH_TYPES.to_vec(),
        }
    }
}

/// Access-token refresh settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Platform API base URL; the token endpoint is `{api_base_url}/token`.
    pub api_base_url: String,
    /// Seconds between scheduled refreshes.
    pub refresh_interval_secs: u64,
    /// Timeout for one token request.
    pub request_timeout_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Payload cache settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Cache directory. Defaults to `~/.wxoa/cache`.
    pub cache_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

// ── Validated settings ──────────────────────────────────────────

/// Fully resolved settings; every required value is present.
#[derive(Clone)]
pub struct Settings {
    /// Application id.
    pub app_id: String,
    /// Application secret.
    pub app_secret: String,
    /// Verification token.
    pub token: String,
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Message kinds dispatched to handlers.
    pub dispatch_types: HashSet<MessageType>,
    /// Platform API base URL.
    pub api_base_url: String,
    /// Interval between scheduled refreshes.
    pub refresh_interval: Duration,
    /// Timeout for one token request.
    pub request_timeout: Duration,
    /// Payload cache directory.
    pub cache_dir: PathBuf,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("app_id", &self.app_id)
            .field("app_secret", &"[REDACTED]")
            .field("token", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dispatch_types", &self.dispatch_types)
            .field("api_base_url", &self.api_base_url)
            .field("refresh_interval", &self.refresh_interval)
            .field("request_timeout", &self.request_timeout)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl Settings {
    /// Listener options for the webhook server.
    pub fn webhook_options(&self) -> WebhookOptions {
        WebhookOptions {
            host: self.host.clone(),
            port: self.port,
            token: self.token.clone(),
            dispatch_types: self.dispatch_types.clone(),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────

impl Config {
    /// Apply environment overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `WXOA_PORT` is not a port number.
    pub fn apply_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = env(APP_ID_ENV) {
            self.account.app_id = Some(v);
        }
        if let Some(v) = env(APP_SECRET_ENV) {
            self.account.app_secret = Some(v);
        }
        if let Some(v) = env(TOKEN_ENV) {
            self.account.token = Some(v);
        }
        if let Some(v) = env(PORT_ENV) {
            let port = v.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
                field: "webhook.port",
                reason: format!("{v:?} is not a port number ({e})"),
            })?;
            self.webhook.port = Some(port);
        }
        if let Some(v) = env(CACHE_DIR_ENV) {
            self.store.cache_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env(API_BASE_URL_ENV) {
            self.credentials.api_base_url = v;
        }
        Ok(())
    }

    /// Payload cache directory, defaulting to `~/.wxoa/cache`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::HomeDir`] when no directory is configured and
    /// the home directory is unknown.
    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.store.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("cache")),
        }
    }

    /// Check required values and resolve defaults into [`Settings`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for the first absent required value
    /// and [`ConfigError::Invalid`] for unusable ones.
    pub fn validate(self) -> Result<Settings, ConfigError> {
        let app_id = required(self.account.app_id, "account.app_id", APP_ID_ENV)?;
        let app_secret = required(self.account.app_secret, "account.app_secret", APP_SECRET_ENV)?;
        let token = required(self.account.token, "account.token", TOKEN_ENV)?;
        let port = self.webhook.port.ok_or(ConfigError::Missing {
            field: "webhook.port",
            env: PORT_ENV,
        })?;

        if self.credentials.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "credentials.refresh_interval_secs",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.credentials.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "credentials.request_timeout_secs",
                reason: "must be greater than zero".to_owned(),
            });
        }

        let cache_dir = match self.store.cache_dir {
            Some(dir) => dir,
            None => config_dir()?.join("cache"),
        };

        Ok(Settings {
            app_id,
            app_secret,
            token,
            host: self.webhook.host,
            port,
            dispatch_types: self.webhook.dispatch_types.into_iter().collect(),
            api_base_url: self.credentials.api_base_url,
            refresh_interval: Duration::from_secs(self.credentials.refresh_interval_secs),
            request_timeout: Duration::from_secs(self.credentials.request_timeout_secs),
            cache_dir,
        })
    }
}

fn required(
    value: Option<String>,
    field: &'static str,
    env: &'static str,
) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing { field, env })
}

/// Load the config file at `path`. A missing file yields defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
/// exists but is unusable.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!(path = %path.display(), "loading config from file");
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Ok(Config::default())
        }
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Resolve the config file path using a custom env resolver.
///
/// # Errors
///
/// Returns [`ConfigError::HomeDir`] when no override is set and the home
/// directory is unknown.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf, ConfigError> {
    if let Some(p) = env(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve the default config directory (`~/.wxoa/`).
///
/// # Errors
///
/// Returns [`ConfigError::HomeDir`] if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let home = directories::BaseDirs::new().ok_or(ConfigError::HomeDir)?;
    Ok(home.home_dir().join(".wxoa"))
}

/// Load the config file and apply overrides from the process environment.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file is unusable or an override is invalid.
pub fn load_unvalidated() -> Result<Config, ConfigError> {
    let env = |key: &str| std::env::var(key).ok();
    let path = config_path_with(env)?;
    let mut config = load_config(&path)?;
    config.apply_overrides(env)?;
    Ok(config)
}

/// Load, override from the process environment, and validate.
///
/// # Errors
///
/// Returns any [`ConfigError`]; all are fatal at startup.
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_unvalidated()?.validate()
}
