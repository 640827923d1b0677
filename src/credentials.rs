//! Access-token lifecycle: fetch, cache, persist, and periodic refresh.
//!
//! The [`CredentialManager`] owns the single process-wide bearer token used
//! for outbound platform calls. [`CredentialManager::refresh`] is cheap when
//! the persisted token is still fresh and only reaches the remote token
//! endpoint once it has expired. Refreshes are serialized so two callers can
//! never both fetch and race on the final write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::store::{PayloadStore, StoreError};

/// Default platform API base URL.
pub const DEFAULT_API_BASE_URL: &str = "https://api.weixin.qq.com/cgi-bin";

/// Default timeout for a token request.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default interval between scheduled refreshes.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No refresh has succeeded yet.
    #[error("access token not initialized")]
    NotInitialized,

    /// The token endpoint could not be reached or returned a non-success status.
    #[error("token endpoint unavailable: {0}")]
    RemoteUnavailable(String),

    /// The platform answered with a non-zero `errcode`.
    #[error("token request rejected ({code}): {message}")]
    RemoteRejected {
        /// Platform error code.
        code: i64,
        /// Platform error message.
        message: String,
    },

    /// The response body did not carry a usable token.
    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    /// Reading or writing the persisted credential failed.
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// A bearer token together with when it was issued and how long it lives.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token.
    pub token: String,
    /// When the token was obtained.
    pub issued_at: DateTime<Utc>,
    /// Lifetime reported by the platform, in seconds.
    pub ttl_seconds: u64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

impl Credential {
    /// Build a credential. Returns `None` when `ttl_seconds` is zero.
    pub fn new(token: String, issued_at: DateTime<Utc>, ttl_seconds: u64) -> Option<Self> {
        if ttl_seconds == 0 {
            return None;
        }
        Some(Self {
            token,
            issued_at,
            ttl_seconds,
        })
    }

    /// Instant after which the token is stale.
    ///
    /// Saturates at the maximum representable time.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| self.issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the token is still fresh at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Token endpoint
// ---------------------------------------------------------------------------

/// A freshly granted token as reported by the endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Bearer token.
    pub access_token: String,
    /// Lifetime in seconds, always non-zero.
    pub expires_in: u64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Remote source of access tokens.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange application credentials for a new access token.
    async fn fetch_token(&self, app_id: &str, app_secret: &str)
        -> Result<TokenGrant, CredentialError>;
}

/// JSON body of `GET /token`.
#[derive(Debug, Default, Deserialize)]
pub struct TokenResponse {
    /// Non-zero on failure.
    #[serde(default)]
    pub errcode: Option<i64>,
    /// Human-readable error.
    #[serde(default)]
    pub errmsg: Option<String>,
    /// Granted token.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Interpret the body as a grant or a platform error.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::RemoteRejected`] for a non-zero `errcode`
    /// and [`CredentialError::MalformedResponse`] when the token or its
    /// lifetime is missing.
    pub fn into_grant(self) -> Result<TokenGrant, CredentialError> {
        if let Some(code) = self.errcode.filter(|code| *code != 0) {
            return Err(CredentialError::RemoteRejected {
                code,
                message: self.errmsg.unwrap_or_default(),
            });
        }
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CredentialError::MalformedResponse("missing access_token".to_owned()))?;
        let expires_in = self
            .expires_in
            .filter(|ttl| *ttl > 0)
            .ok_or_else(|| {
                CredentialError::MalformedResponse("missing or zero expires_in".to_owned())
            })?;
        Ok(TokenGrant {
            access_token,
            expires_in,
        })
    }
}

/// Token endpoint reached over HTTPS.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenEndpoint {
    /// Create an endpoint client for `base_url` with the given request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Returns the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn fetch_token(
        &self,
        app_id: &str,
        app_secret: &str,
    ) -> Result<TokenGrant, CredentialError> {
        let url = format!("{}/token", self.base_url.trim_end_matches('/'));
        // The query carries the app secret; strip the URL from every error.
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", app_id),
                ("secret", app_secret),
            ])
            .send()
            .await
            .map_err(|e| CredentialError::RemoteUnavailable(e.without_url().to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CredentialError::RemoteUnavailable(format!(
                "token endpoint returned {status}"
            )));
        }

        let body: TokenResponse = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                CredentialError::RemoteUnavailable(e.without_url().to_string())
            } else {
                CredentialError::MalformedResponse(e.without_url().to_string())
            }
        })?;
        body.into_grant()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// What a successful [`CredentialManager::refresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The persisted token was still fresh; no remote call was made.
    Cached {
        /// When the cached token goes stale.
        expires_at: DateTime<Utc>,
    },
    /// A new token was fetched and persisted.
    Fetched {
        /// When the new token goes stale.
        expires_at: DateTime<Utc>,
        /// Lifetime reported by the platform.
        ttl_seconds: u64,
    },
}

/// Owns the shared access token and keeps it fresh.
pub struct CredentialManager {
    app_id: String,
    app_secret: String,
    store: PayloadStore,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<Credential>>,
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("app_id", &self.app_id)
            .field("app_secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    /// Create a manager using the wall clock.
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        store: PayloadStore,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        Self::with_clock(app_id, app_secret, store, endpoint, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit time source.
    pub fn with_clock(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        store: PayloadStore,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            store,
            endpoint,
            clock,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns the cached token, stale or not.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotInitialized`] until a refresh succeeds.
    pub async fn get_token(&self) -> Result<String, CredentialError> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|credential| credential.token.clone())
            .ok_or(CredentialError::NotInitialized)
    }

    /// Returns a copy of the cached credential, if any.
    pub async fn credential(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    /// Make sure a fresh token is cached, fetching one only if needed.
    ///
    /// On failure the previously cached token is left untouched.
    ///
    /// # Errors
    ///
    /// Returns the endpoint error ([`CredentialError::RemoteUnavailable`],
    /// [`CredentialError::RemoteRejected`],
    /// [`CredentialError::MalformedResponse`]) or a store error.
    pub async fn refresh(&self) -> Result<RefreshOutcome, CredentialError> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(existing) = self.store.get_credential().await? {
            if existing.is_fresh(self.clock.now()) {
                let expires_at = existing.expires_at();
                debug!(%expires_at, "persisted access token still fresh");
                *self.current.write().await = Some(existing);
                return Ok(RefreshOutcome::Cached { expires_at });
            }
            debug!(expired_at = %existing.expires_at(), "persisted access token is stale");
        }

        info!(app_id = %self.app_id, "requesting new access token");
        let grant = self
            .endpoint
            .fetch_token(&self.app_id, &self.app_secret)
            .await?;

        let ttl_seconds = grant.expires_in;
        let credential = Credential::new(grant.access_token, self.clock.now(), ttl_seconds)
            .ok_or_else(|| CredentialError::MalformedResponse("zero expires_in".to_owned()))?;
        let expires_at = credential.expires_at();

        // The old token may already be revoked remotely, so cache first and
        // surface a failed write afterwards.
        *self.current.write().await = Some(credential.clone());
        self.store.set_credential(&credential).await?;

        info!(ttl_seconds, %expires_at, "access token refreshed");
        Ok(RefreshOutcome::Fetched {
            expires_at,
            ttl_seconds,
        })
    }
}

/// Run the periodic refresh loop until `shutdown_rx` flips to `true`.
///
/// The first tick fires one `interval` after the call; the eager startup
/// refresh is the caller's job. Failed ticks are logged and retried on the
/// next tick.
pub async fn run_refresh_loop(
    manager: Arc<CredentialManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "access token refresh loop started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Skip the first immediate tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.refresh().await {
                    Ok(RefreshOutcome::Fetched { ttl_seconds, .. })
                        if ttl_seconds <= interval.as_secs() =>
                    {
                        warn!(
                            ttl_seconds,
                            interval_secs = interval.as_secs(),
                            "token lifetime is not longer than the refresh interval"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "scheduled access token refresh failed"),
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("access token refresh loop shutting down");
                    break;
                }
            }
        }
    }
}
