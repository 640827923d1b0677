//! Credential manager freshness and failure handling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use wxoa::credentials::{
    run_refresh_loop, Clock, Credential, CredentialError, CredentialManager, RefreshOutcome,
    TokenEndpoint, TokenGrant,
};
use wxoa::store::PayloadStore;

// ── Fakes ───────────────────────────────────────────────────────

struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    fn advance(&self, secs: i64) {
        let mut now = self.now.lock().expect("clock lock");
        *now = now
            .checked_add_signed(chrono::Duration::seconds(secs))
            .expect("clock stays in range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Replays scripted responses and counts calls.
#[derive(Default)]
struct ScriptedEndpoint {
    calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<TokenGrant, CredentialError>>>,
}

impl ScriptedEndpoint {
    fn push_grant(&self, token: &str, expires_in: u64) {
        self.responses
            .lock()
            .expect("script lock")
            .push_back(Ok(TokenGrant {
                access_token: token.to_owned(),
                expires_in,
            }));
    }

    fn push_error(&self, err: CredentialError) {
        self.responses
            .lock()
            .expect("script lock")
            .push_back(Err(err));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenEndpoint for ScriptedEndpoint {
    async fn fetch_token(
        &self,
        _app_id: &str,
        _app_secret: &str,
    ) -> Result<TokenGrant, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Err(CredentialError::RemoteUnavailable("no script".to_owned())))
    }
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
        .single()
        .expect("valid timestamp")
}

struct Harness {
    _tmp: tempfile::TempDir,
    store: PayloadStore,
    endpoint: Arc<ScriptedEndpoint>,
    clock: Arc<ManualClock>,
    manager: Arc<CredentialManager>,
}

async fn harness() -> Harness {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = match PayloadStore::open(tmp.path()).await {
        Ok(store) => store,
        Err(err) => panic!("store should open: {err}"),
    };
    let endpoint = Arc::new(ScriptedEndpoint::default());
    let clock = Arc::new(ManualClock::new(start_time()));
    let manager = Arc::new(CredentialManager::with_clock(
        "wx_app",
        "app_secret",
        store.clone(),
        Arc::clone(&endpoint) as Arc<dyn TokenEndpoint>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    Harness {
        _tmp: tmp,
        store,
        endpoint,
        clock,
        manager,
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn get_token_before_refresh_is_not_initialized() {
    let h = harness().await;
    assert!(matches!(
        h.manager.get_token().await,
        Err(CredentialError::NotInitialized)
    ));
    assert!(h.manager.credential().await.is_none());
}

#[tokio::test]
async fn first_refresh_fetches_and_persists() {
    let h = harness().await;
    h.endpoint.push_grant("T1", 7200);

    let outcome = h.manager.refresh().await.expect("refresh should succeed");
    let expected_expiry = start_time()
        .checked_add_signed(chrono::Duration::seconds(7200))
        .expect("expiry in range");
    assert_eq!(
        outcome,
        RefreshOutcome::Fetched {
            expires_at: expected_expiry,
            ttl_seconds: 7200,
        }
    );
    assert_eq!(h.endpoint.calls(), 1);
    assert_eq!(h.manager.get_token().await.expect("token"), "T1");

    let stored = h
        .store
        .get_credential()
        .await
        .expect("store read")
        .expect("credential persisted");
    assert_eq!(stored.token, "T1");
    assert_eq!(stored.ttl_seconds, 7200);
    assert_eq!(stored.issued_at, start_time());
}

#[tokio::test]
async fn fresh_credential_skips_remote_call() {
    let h = harness().await;
    h.endpoint.push_grant("T1", 7200);
    h.manager.refresh().await.expect("first refresh");

    h.clock.advance(3600);
    let outcome = h.manager.refresh().await.expect("second refresh");
    assert!(matches!(outcome, RefreshOutcome::Cached { .. }));
    assert_eq!(h.endpoint.calls(), 1);
    assert_eq!(h.manager.get_token().await.expect("token"), "T1");
}

#[tokio::test]
async fn expired_credential_triggers_exactly_one_call() {
    let h = harness().await;
    h.endpoint.push_grant("T1", 7200);
    h.endpoint.push_grant("T2", 7200);
    h.manager.refresh().await.expect("first refresh");

    h.clock.advance(7200);
    let outcome = h.manager.refresh().await.expect("second refresh");
    assert!(matches!(outcome, RefreshOutcome::Fetched { .. }));
    assert_eq!(h.endpoint.calls(), 2);
    assert_eq!(h.manager.get_token().await.expect("token"), "T2");
}

#[tokio::test]
async fn persisted_fresh_credential_is_adopted_without_call() {
    let h = harness().await;
    let existing =
        Credential::new("PERSISTED".to_owned(), start_time(), 7200).expect("non-zero ttl");
    h.store
        .set_credential(&existing)
        .await
        .expect("seed credential");

    let outcome = h.manager.refresh().await.expect("refresh");
    assert!(matches!(outcome, RefreshOutcome::Cached { .. }));
    assert_eq!(h.endpoint.calls(), 0);
    assert_eq!(h.manager.get_token().await.expect("token"), "PERSISTED");
}

#[tokio::test]
async fn failed_refresh_keeps_previous_token() {
    let h = harness().await;
    h.endpoint.push_grant("T1", 7200);
    h.manager.refresh().await.expect("first refresh");

    h.clock.advance(8000);
    h.endpoint.push_error(CredentialError::RemoteUnavailable(
        "token endpoint returned 500 Internal Server Error".to_owned(),
    ));
    assert!(matches!(
        h.manager.refresh().await,
        Err(CredentialError::RemoteUnavailable(_))
    ));

    // Stale but still served.
    assert_eq!(h.manager.get_token().await.expect("token"), "T1");
    let stored = h
        .store
        .get_credential()
        .await
        .expect("store read")
        .expect("credential still persisted");
    assert_eq!(stored.token, "T1");
}

#[tokio::test]
async fn rejected_refresh_surfaces_platform_code() {
    let h = harness().await;
    h.endpoint.push_error(CredentialError::RemoteRejected {
        code: 40013,
        message: "invalid appid".to_owned(),
    });

    match h.manager.refresh().await {
        Err(CredentialError::RemoteRejected { code, .. }) => assert_eq!(code, 40013),
        other => panic!("expected RemoteRejected, got: {other:?}"),
    }
    assert!(matches!(
        h.manager.get_token().await,
        Err(CredentialError::NotInitialized)
    ));
}

#[tokio::test]
async fn concurrent_refreshes_fetch_once() {
    let h = harness().await;
    h.endpoint.push_grant("T1", 7200);
    h.endpoint.push_grant("T2", 7200);

    let a = Arc::clone(&h.manager);
    let b = Arc::clone(&h.manager);
    let (first, second) = tokio::join!(a.refresh(), b.refresh());
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(h.endpoint.calls(), 1);
}

#[tokio::test]
async fn credential_debug_redacts_token() {
    let credential =
        Credential::new("super-secret".to_owned(), start_time(), 60).expect("non-zero ttl");
    let debug = format!("{credential:?}");
    assert!(!debug.contains("super-secret"));
    assert!(debug.contains("[REDACTED]"));
}

#[tokio::test]
async fn refresh_loop_stops_on_shutdown() {
    let h = harness().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run_refresh_loop(
        Arc::clone(&h.manager),
        Duration::from_secs(300),
        shutdown_rx,
    ));

    shutdown_tx.send(true).expect("loop should be listening");
    let joined = tokio::time::timeout(Duration::from_secs(1), task).await;
    assert!(joined.is_ok(), "refresh loop should exit after shutdown");
    assert_eq!(h.endpoint.calls(), 0);
}
