//! Webhook endpoint: verification handshake and inbound message delivery.
//!
//! `GET /` answers the platform's ownership handshake, `POST /` accepts the
//! XML envelope of an inbound message and dispatches recognized kinds to the
//! handlers registered for [`EventKind::Message`], sequentially and in
//! registration order.
//!
//! The server is either not started or listening; it keeps no per-message
//! state. Handlers can only be registered before [`WebhookServer::start`].

pub mod envelope;
pub mod verify;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{InboundMessage, MessageType};

use self::verify::VerificationRequest;

/// Message kinds dispatched when none are configured.
pub const DEFAULT_DISPATCH_TYPES: [MessageType; 2] = [MessageType::Text, MessageType::Image];

/// Errors from the webhook server.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// `start` was already called, or a handler was registered after it.
    #[error("webhook server already started")]
    AlreadyStarted,

    /// Inbound request could not be interpreted.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The server task failed.
    #[error("webhook server failed: {0}")]
    Serve(String),
}

// ---------------------------------------------------------------------------
// Dispatch table
// ---------------------------------------------------------------------------

/// Events handlers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A decoded inbound message of a dispatched kind.
    Message,
}

/// Receives dispatched inbound messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message. Errors are logged by the server and do not stop
    /// later handlers.
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()>;
}

/// Ordered handler lists per event kind.
#[derive(Clone, Default)]
struct HandlerTable {
    handlers: HashMap<EventKind, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerTable {
    fn register(&mut self, kind: EventKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    fn count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler for `kind` in order. Returns how many failed.
    async fn dispatch(&self, kind: EventKind, message: &InboundMessage) -> usize {
        let Some(handlers) = self.handlers.get(&kind) else {
            return 0;
        };
        let mut failed: usize = 0;
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(e) = handler.handle(message).await {
                failed = failed.saturating_add(1);
                warn!(
                    ?kind,
                    handler = index,
                    message_id = %message.message_id,
                    error = %e,
                    "message handler failed"
                );
            }
        }
        failed
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Listener options.
#[derive(Clone)]
pub struct WebhookOptions {
    /// Interface to bind, e.g. `0.0.0.0`.
    pub host: String,
    /// Port to bind; 0 picks a free port.
    pub port: u16,
    /// Shared verification token configured on the platform.
    pub token: String,
    /// Message kinds handed to [`EventKind::Message`] handlers.
    pub dispatch_types: HashSet<MessageType>,
}

impl std::fmt::Debug for WebhookOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &"[REDACTED]")
            .field("dispatch_types", &self.dispatch_types)
            .finish()
    }
}

impl WebhookOptions {
    /// Options with the default dispatched kinds (`text`, `image`).
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
            dispatch_types: DEFAULT_DISPATCH_TYPES.into_iter().collect(),
        }
    }
}

/// Lifecycle state reported by [`WebhookServer::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Handlers may still be registered.
    NotStarted,
    /// Accepting connections.
    Listening,
    /// Stopped after listening; cannot be restarted.
    Stopped,
}

enum ServerState {
    NotStarted,
    Listening {
        local_addr: SocketAddr,
        shutdown_tx: oneshot::Sender<()>,
        handle: JoinHandle<std::io::Result<()>>,
    },
    Stopped,
}

/// Shared state for the axum handlers.
struct AppState {
    token: String,
    dispatch_types: HashSet<MessageType>,
    handlers: HandlerTable,
}

/// HTTP endpoint for platform callbacks.
pub struct WebhookServer {
    options: WebhookOptions,
    handlers: HandlerTable,
    state: ServerState,
}

impl std::fmt::Debug for WebhookServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookServer")
            .field("options", &self.options)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl WebhookServer {
    /// Create a server that has not started listening.
    pub fn new(options: WebhookOptions) -> Self {
        Self {
            options,
            handlers: HandlerTable::default(),
            state: ServerState::NotStarted,
        }
    }

    /// Append a handler for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::AlreadyStarted`] once the server has started.
    pub fn register_handler(
        &mut self,
        kind: EventKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), WebhookError> {
        if !matches!(self.state, ServerState::NotStarted) {
            return Err(WebhookError::AlreadyStarted);
        }
        self.handlers.register(kind, handler);
        debug!(?kind, total = self.handlers.count(kind), "handler registered");
        Ok(())
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.count(kind)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ServerStatus {
        match self.state {
            ServerState::NotStarted => ServerStatus::NotStarted,
            ServerState::Listening { .. } => ServerStatus::Listening,
            ServerState::Stopped => ServerStatus::Stopped,
        }
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.state {
            ServerState::Listening { local_addr, .. } => Some(local_addr),
            _ => None,
        }
    }

    /// Build the router with a snapshot of the currently registered handlers.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            token: self.options.token.clone(),
            dispatch_types: self.options.dispatch_types.clone(),
            handlers: self.handlers.clone(),
        });
        Router::new()
            .route("/", get(verify_handshake).post(receive_message))
            .with_state(state)
    }

    /// Bind the configured address and start serving in a background task.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::AlreadyStarted`] on a second call and
    /// [`WebhookError::Bind`] if the address cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr, WebhookError> {
        if !matches!(self.state, ServerState::NotStarted) {
            return Err(WebhookError::AlreadyStarted);
        }

        let addr = format!("{}:{}", self.options.host, self.options.port);
        let bind_err = |source| WebhookError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let app = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(%local_addr, "webhook server listening");
        self.state = ServerState::Listening {
            local_addr,
            shutdown_tx,
            handle,
        };
        Ok(local_addr)
    }

    /// Stop accepting connections and wait for in-flight requests.
    ///
    /// Does nothing if the server is not listening.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Serve`] if the server task failed.
    pub async fn stop(&mut self) -> Result<(), WebhookError> {
        let (local_addr, shutdown_tx, handle) =
            match std::mem::replace(&mut self.state, ServerState::Stopped) {
                ServerState::Listening {
                    local_addr,
                    shutdown_tx,
                    handle,
                } => (local_addr, shutdown_tx, handle),
                ServerState::NotStarted => {
                    self.state = ServerState::NotStarted;
                    return Ok(());
                }
                ServerState::Stopped => return Ok(()),
            };

        let _ = shutdown_tx.send(());
        let result = handle
            .await
            .map_err(|e| WebhookError::Serve(e.to_string()))?;
        result.map_err(|e| WebhookError::Serve(e.to_string()))?;
        info!(%local_addr, "webhook server stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// GET `/`: platform handshake. Always answers with a non-5xx status.
async fn verify_handshake(
    State(state): State<Arc<AppState>>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> (StatusCode, String) {
    let params = match query {
        Ok(Query(params)) => params,
        Err(e) => {
            warn!(error = %e, "unreadable handshake query");
            return (StatusCode::BAD_REQUEST, String::new());
        }
    };

    let request = match VerificationRequest::from_query(&params) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "incomplete handshake request");
            return (StatusCode::BAD_REQUEST, String::new());
        }
    };

    debug!(timestamp = %request.timestamp, nonce = %request.nonce, "handshake received");
    match verify::verify(&request, &state.token) {
        Ok(echo) => {
            info!("handshake signature accepted");
            (StatusCode::OK, echo)
        }
        Err(e) => {
            warn!(error = %e, "handshake signature mismatch");
            (StatusCode::OK, String::new())
        }
    }
}

/// POST `/`: inbound message delivery. Acknowledged with an empty body.
async fn receive_message(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let text = match std::str::from_utf8(&body) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "dropping non-UTF-8 message body");
            return StatusCode::BAD_REQUEST;
        }
    };
    debug!(bytes = body.len(), "message envelope received");

    let message = match envelope::decode_message(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping undecodable message envelope");
            return StatusCode::BAD_REQUEST;
        }
    };

    if !state.dispatch_types.contains(&message.msg_type) {
        debug!(
            message_id = %message.message_id,
            msg_type = %message.msg_type,
            "message accepted but not dispatched"
        );
        return StatusCode::OK;
    }

    let failed = state.handlers.dispatch(EventKind::Message, &message).await;
    debug!(
        message_id = %message.message_id,
        msg_type = %message.msg_type,
        failed,
        "message dispatched"
    );
    StatusCode::OK
}
