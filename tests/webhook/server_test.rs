//! Server lifecycle over a real socket.

use std::sync::Arc;

use async_trait::async_trait;

use wxoa::types::InboundMessage;
use wxoa::webhook::verify::signature;
use wxoa::webhook::{
    EventKind, MessageHandler, ServerStatus, WebhookError, WebhookOptions, WebhookServer,
};

struct Noop;

#[async_trait]
impl MessageHandler for Noop {
    async fn handle(&self, _message: &InboundMessage) -> anyhow::Result<()> {
        Ok(())
    }
}

fn server() -> WebhookServer {
    WebhookServer::new(WebhookOptions::new("127.0.0.1", 0, "mytoken"))
}

#[tokio::test]
async fn start_binds_and_serves_handshake() {
    let mut server = server();
    assert_eq!(server.status(), ServerStatus::NotStarted);
    assert!(server.local_addr().is_none());

    let addr = server.start().await.expect("start should succeed");
    assert_eq!(server.status(), ServerStatus::Listening);
    assert_eq!(server.local_addr(), Some(addr));

    let sig = signature("10", "20", "mytoken");
    let url = format!("http://{addr}/?timestamp=10&nonce=20&signature={sig}&echostr=pong");
    let response = reqwest::get(url).await.expect("request should complete");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "pong");

    server.stop().await.expect("stop should succeed");
    assert_eq!(server.status(), ServerStatus::Stopped);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let mut server = server();
    server.start().await.expect("first start");
    assert!(matches!(
        server.start().await,
        Err(WebhookError::AlreadyStarted)
    ));
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn register_after_start_is_rejected() {
    let mut server = server();
    server.start().await.expect("start");
    assert!(matches!(
        server.register_handler(EventKind::Message, Arc::new(Noop)),
        Err(WebhookError::AlreadyStarted)
    ));
    assert_eq!(server.handler_count(EventKind::Message), 0);
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let mut server = server();
    server.stop().await.expect("stop before start is a no-op");
    assert_eq!(server.status(), ServerStatus::NotStarted);

    server.start().await.expect("start");
    server.stop().await.expect("first stop");
    server.stop().await.expect("second stop");
    assert_eq!(server.status(), ServerStatus::Stopped);
}

#[tokio::test]
async fn stopped_server_cannot_restart() {
    let mut server = server();
    server.start().await.expect("start");
    server.stop().await.expect("stop");
    assert!(matches!(
        server.start().await,
        Err(WebhookError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn occupied_port_is_bind_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let port = listener.local_addr().expect("local addr").port();

    let mut server = WebhookServer::new(WebhookOptions::new("127.0.0.1", port, "mytoken"));
    assert!(matches!(
        server.start().await,
        Err(WebhookError::Bind { .. })
    ));
    assert_eq!(server.status(), ServerStatus::NotStarted);
}
