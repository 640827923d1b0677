//! Official Account composition root.
//!
//! [`OfficialAccount`] owns the payload store, the credential manager, the
//! webhook server and the periodic refresh task, and exposes them to a host
//! through three narrow capability traits.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::credentials::{
    run_refresh_loop, CredentialError, CredentialManager, HttpTokenEndpoint, RefreshOutcome,
    TokenEndpoint,
};
use crate::store::{PayloadStore, StoreError};
use crate::types::{ContactRecord, InboundMessage};
use crate::webhook::{EventKind, MessageHandler, WebhookError, WebhookServer};

/// Errors from account lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    /// Payload store failure.
    #[error("payload store: {0}")]
    Store(#[from] StoreError),

    /// Access token could not be obtained.
    #[error("credentials: {0}")]
    Credential(#[from] CredentialError),

    /// Webhook server failure.
    #[error("webhook: {0}")]
    Webhook(#[from] WebhookError),
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Supplies the current access token for outbound API calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The cached token, possibly stale.
    async fn access_token(&self) -> Result<String, CredentialError>;
}

/// Reads and writes message payloads.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Load a message by platform message id.
    async fn message_payload(&self, message_id: &str) -> Result<InboundMessage, StoreError>;

    /// Persist a message under its own id.
    async fn save_message(&self, message: &InboundMessage) -> Result<(), StoreError>;
}

/// Reads and writes contact payloads.
#[async_trait]
pub trait ContactSink: Send + Sync {
    /// Load a contact by `openid`.
    async fn contact_payload(&self, openid: &str) -> Result<ContactRecord, StoreError>;

    /// Persist a contact under its `openid`.
    async fn save_contact(&self, contact: &ContactRecord) -> Result<(), StoreError>;
}

#[async_trait]
impl CredentialProvider for CredentialManager {
    async fn access_token(&self) -> Result<String, CredentialError> {
        self.get_token().await
    }
}

#[async_trait]
impl MessageSink for PayloadStore {
    async fn message_payload(&self, message_id: &str) -> Result<InboundMessage, StoreError> {
        self.get_message(message_id).await
    }

    async fn save_message(&self, message: &InboundMessage) -> Result<(), StoreError> {
        self.set_message(&message.message_id, message).await
    }
}

#[async_trait]
impl ContactSink for PayloadStore {
    async fn contact_payload(&self, openid: &str) -> Result<ContactRecord, StoreError> {
        self.get_contact(openid).await
    }

    async fn save_contact(&self, contact: &ContactRecord) -> Result<(), StoreError> {
        self.set_contact(&contact.openid, contact).await
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Persists every dispatched message through a [`MessageSink`].
pub struct StoreMessageHandler {
    sink: Arc<dyn MessageSink>,
}

impl StoreMessageHandler {
    /// Wrap a sink.
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageHandler for StoreMessageHandler {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        self.sink.save_message(message).await?;
        debug!(message_id = %message.message_id, "message payload stored");
        Ok(())
    }
}

/// Forwards every dispatched message on a bounded channel.
///
/// A full channel applies backpressure to the webhook request; a closed one
/// is reported as a handler failure.
pub struct ForwardingHandler {
    tx: mpsc::Sender<InboundMessage>,
}

impl ForwardingHandler {
    /// Forward into `tx`.
    pub fn new(tx: mpsc::Sender<InboundMessage>) -> Self {
        Self { tx }
    }

    /// Create a handler plus the receiving end of a channel of `capacity`.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl MessageHandler for ForwardingHandler {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| anyhow::anyhow!("message receiver dropped"))
    }
}

// ---------------------------------------------------------------------------
// Composition root
// ---------------------------------------------------------------------------

/// A running (or ready to run) Official Account adapter.
pub struct OfficialAccount {
    settings: Settings,
    store: PayloadStore,
    credentials: Arc<CredentialManager>,
    server: WebhookServer,
    shutdown_tx: watch::Sender<bool>,
    refresh_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for OfficialAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfficialAccount")
            .field("settings", &self.settings)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl OfficialAccount {
    /// Open the store and wire components against the platform token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Store`] if the cache directory cannot be opened.
    pub async fn open(settings: Settings) -> Result<Self, AccountError> {
        let endpoint = Arc::new(HttpTokenEndpoint::new(
            settings.api_base_url.clone(),
            settings.request_timeout,
        ));
        Self::with_endpoint(settings, endpoint).await
    }

    /// Open the store and wire components against an explicit token endpoint.
    ///
    /// The store handler is registered first so later handlers see messages
    /// that are already persisted.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Store`] if the cache directory cannot be opened.
    pub async fn with_endpoint(
        settings: Settings,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Result<Self, AccountError> {
        let store = PayloadStore::open(&settings.cache_dir).await?;
        let credentials = Arc::new(CredentialManager::new(
            settings.app_id.clone(),
            settings.app_secret.clone(),
            store.clone(),
            endpoint,
        ));

        let mut server = WebhookServer::new(settings.webhook_options());
        server.register_handler(
            EventKind::Message,
            Arc::new(StoreMessageHandler::new(Arc::new(store.clone()))),
        )?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            settings,
            store,
            credentials,
            server,
            shutdown_tx,
            refresh_task: None,
        })
    }

    /// Append a message handler. Only possible before [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::AlreadyStarted`] once started.
    pub fn register_handler(
        &mut self,
        kind: EventKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), WebhookError> {
        self.server.register_handler(kind, handler)
    }

    /// Register a [`ForwardingHandler`] and return its receiver.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::AlreadyStarted`] once started.
    pub fn forward_messages(
        &mut self,
        capacity: usize,
    ) -> Result<mpsc::Receiver<InboundMessage>, WebhookError> {
        let (handler, rx) = ForwardingHandler::channel(capacity);
        self.server
            .register_handler(EventKind::Message, Arc::new(handler))?;
        Ok(rx)
    }

    /// Refresh the token, start listening and schedule periodic refreshes.
    ///
    /// A failed initial refresh aborts startup; nothing is left running.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Credential`] if no token could be obtained and
    /// [`AccountError::Webhook`] if the listener cannot start.
    pub async fn start(&mut self) -> Result<SocketAddr, AccountError> {
        if self.refresh_task.is_some() {
            return Err(WebhookError::AlreadyStarted.into());
        }

        match self.credentials.refresh().await? {
            RefreshOutcome::Cached { expires_at } => {
                info!(%expires_at, "using persisted access token");
            }
            RefreshOutcome::Fetched { expires_at, .. } => {
                info!(%expires_at, "obtained access token");
            }
        }

        let addr = self.server.start().await?;

        let manager = Arc::clone(&self.credentials);
        let interval = self.settings.refresh_interval;
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.refresh_task = Some(tokio::spawn(run_refresh_loop(
            manager,
            interval,
            shutdown_rx,
        )));

        info!(%addr, app_id = %self.settings.app_id, "official account started");
        Ok(addr)
    }

    /// Stop the refresh task and listener, then close the store.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Webhook`] if the server task failed.
    pub async fn stop(&mut self) -> Result<(), AccountError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.refresh_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "refresh task ended abnormally");
            }
        }
        let result = self.server.stop().await;
        self.store.close().await;
        info!("official account stopped");
        result.map_err(AccountError::from)
    }

    /// Bound webhook address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// The payload store.
    pub fn store(&self) -> &PayloadStore {
        &self.store
    }

    /// The credential manager as a host capability.
    pub fn credentials(&self) -> Arc<CredentialManager> {
        Arc::clone(&self.credentials)
    }

    /// Resolved settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
