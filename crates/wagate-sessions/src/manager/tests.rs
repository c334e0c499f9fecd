use super::*;
use crate::testing::{test_router, test_store, FakeFactory};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use wagate_core::event::{MessageKey, RawContent, RawMessage, UpsertKind};

use crate::auth::Credentials;
use crate::bus::Notification;

struct Harness {
    manager: SessionManager,
    factory: Arc<FakeFactory>,
    store: Store,
    signals: broadcast::Receiver<SessionSignal>,
    data_dir: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

impl Harness {
    async fn next_signal(&mut self) -> SessionSignal {
        tokio::time::timeout(Duration::from_secs(5), self.signals.recv())
            .await
            .expect("no session signal")
            .expect("signal channel closed")
    }

    /// Feed a connection update to the latest connection of `s1` and return
    /// the signal it produced.
    async fn emit(&mut self, update: ConnectionUpdate) -> SessionSignal {
        self.factory
            .emit("s1", ProtocolEvent::Connection(update))
            .await;
        self.next_signal().await
    }

    async fn close_and_retry(&mut self, reason: CloseReason) -> Duration {
        match self.emit(ConnectionUpdate::Close(reason)).await {
            SessionSignal::Closed {
                retry_in: Some(delay),
                ..
            } => delay,
            other => panic!("expected a scheduled retry, got {other:?}"),
        }
    }
}

async fn harness(config: SessionConfig) -> Harness {
    let store = test_store().await;
    let factory = Arc::new(FakeFactory::default());
    let data_dir = std::env::temp_dir().join(format!("__wagate_mgr_{}", uuid::Uuid::new_v4()));
    let manager = SessionManager::new(
        config,
        data_dir.clone(),
        store.clone(),
        factory.clone(),
        test_router(&store),
    );
    let signals = manager.subscribe();
    Harness {
        manager,
        factory,
        store,
        signals,
        data_dir,
    }
}

fn slow_reconnects() -> SessionConfig {
    SessionConfig {
        reconnect_step_ms: 150,
        reconnect_cap_ms: 1_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let h = harness(SessionConfig::default()).await;
    h.manager.start("s1", "t1").await.unwrap();
    h.manager.start("s1", "t1").await.unwrap();

    assert_eq!(h.factory.open_count("s1"), 1);
    assert_eq!(h.manager.active_count().await, 1);
    assert_eq!(h.manager.state("s1").await, Some(SessionState::Connecting));
    let instance = h.store.get_instance("s1").await.unwrap().unwrap();
    assert_eq!(instance.company_id, "t1");
    assert_eq!(instance.status, "connecting");
}

#[tokio::test]
async fn test_qr_then_connected() {
    let mut h = harness(SessionConfig::default()).await;
    h.manager.start("s1", "t1").await.unwrap();

    let signal = h.emit(ConnectionUpdate::Qr("QR123".into())).await;
    assert!(matches!(signal, SessionSignal::Qr { code, .. } if code == "QR123"));
    let instance = h.store.get_instance("s1").await.unwrap().unwrap();
    assert_eq!(instance.status, "qr_ready");
    assert_eq!(instance.qrcode_url.as_deref(), Some("QR123"));
    assert_eq!(h.manager.state("s1").await, Some(SessionState::AwaitingScan));
    assert!(qr::png_path(&h.data_dir, "s1").exists());

    let signal = h.emit(ConnectionUpdate::Open).await;
    assert!(matches!(signal, SessionSignal::Connected { .. }));
    let instance = h.store.get_instance("s1").await.unwrap().unwrap();
    assert_eq!(instance.status, "connected");
    assert!(instance.qrcode_url.is_none());
    assert_eq!(instance.profile_name.as_deref(), Some("Loja"));
    assert_eq!(
        instance.owner_jid.as_deref(),
        Some("5511000000000@s.whatsapp.net")
    );
    assert_eq!(h.manager.state("s1").await, Some(SessionState::Connected));
}

#[tokio::test]
async fn test_transient_close_schedules_one_linear_reconnect() {
    let mut h = harness(slow_reconnects()).await;
    h.manager.start("s1", "t1").await.unwrap();
    h.emit(ConnectionUpdate::Open).await;

    let closed_at = Instant::now();
    let delay = h.close_and_retry(CloseReason::transient("network")).await;
    assert_eq!(delay, Duration::from_millis(150));
    assert_eq!(h.manager.attempts("s1").await, Some(1));
    assert_eq!(h.manager.state("s1").await, Some(SessionState::Connecting));
    assert!(h.factory.socket.closed.load(Ordering::SeqCst));
    let instance = h.store.get_instance("s1").await.unwrap().unwrap();
    assert_eq!(instance.status, "disconnected");
    assert_eq!(h.factory.open_count("s1"), 1);

    h.factory.wait_for_opens("s1", 2).await;
    assert!(h.factory.opened_at("s1", 1) - closed_at >= delay);

    // The second cycle fails too, so the wait doubles.
    let closed_at = Instant::now();
    let delay = h.close_and_retry(CloseReason::transient("timeout")).await;
    assert_eq!(delay, Duration::from_millis(300));
    assert_eq!(h.manager.attempts("s1").await, Some(2));
    h.factory.wait_for_opens("s1", 3).await;
    assert!(h.factory.opened_at("s1", 2) - closed_at >= delay);

    h.emit(ConnectionUpdate::Open).await;
    assert_eq!(h.manager.attempts("s1").await, Some(0));
    assert_eq!(h.factory.open_count("s1"), 3);
}

#[tokio::test]
async fn test_backoff_stops_growing_at_cap() {
    let mut h = harness(SessionConfig {
        reconnect_step_ms: 10,
        reconnect_cap_ms: 25,
        ..Default::default()
    })
    .await;
    h.manager.start("s1", "t1").await.unwrap();

    let mut delays = Vec::new();
    for attempt in 1..=5 {
        delays.push(h.close_and_retry(CloseReason::transient("network")).await);
        assert_eq!(h.manager.attempts("s1").await, Some(attempt));
        h.factory.wait_for_opens("s1", attempt as usize + 1).await;
    }

    let ms: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
    assert_eq!(ms, vec![10, 20, 25, 25, 25]);
    assert!(h.manager.active("s1").await.is_some());
}

#[tokio::test]
async fn test_fatal_close_wipes_credentials_without_reconnect() {
    let mut h = harness(SessionConfig {
        reconnect_step_ms: 10,
        ..Default::default()
    })
    .await;
    let auth = AuthStateStore::new(h.store.clone());
    auth.save_creds("s1", &Credentials(vec![1, 2, 3])).await;
    h.manager.start("s1", "t1").await.unwrap();
    h.emit(ConnectionUpdate::Open).await;

    let signal = h.emit(ConnectionUpdate::Close(CloseReason::logged_out())).await;
    assert!(matches!(signal, SessionSignal::Closed { retry_in: None, .. }));

    assert_eq!(h.manager.state("s1").await, None);
    assert!(!auth.has_creds("s1").await);
    let instance = h.store.get_instance("s1").await.unwrap().unwrap();
    assert_eq!(instance.status, "disconnected");

    // Well past one step, nothing has reopened.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.factory.open_count("s1"), 1);
}

#[tokio::test]
async fn test_permanent_rejection_code_is_fatal() {
    let mut h = harness(SessionConfig {
        reconnect_step_ms: 10,
        ..Default::default()
    })
    .await;
    h.manager.start("s1", "t1").await.unwrap();
    let signal = h
        .emit(ConnectionUpdate::Close(CloseReason {
            code: Some(403),
            logged_out: false,
            message: "forbidden".into(),
        }))
        .await;
    assert!(matches!(signal, SessionSignal::Closed { retry_in: None, .. }));
    assert_eq!(h.manager.active_count().await, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.factory.open_count("s1"), 1);
}

#[tokio::test]
async fn test_reconnect_after_stop_does_not_recreate_session() {
    let mut h = harness(slow_reconnects()).await;
    h.manager.start("s1", "t1").await.unwrap();
    let delay = h.close_and_retry(CloseReason::transient("network")).await;

    h.manager.stop("s1").await;
    tokio::time::sleep(delay + Duration::from_millis(100)).await;

    assert_eq!(h.manager.state("s1").await, None);
    assert_eq!(h.factory.open_count("s1"), 1);
}

#[tokio::test]
async fn test_stale_reconnect_timer_is_ignored() {
    let h = harness(slow_reconnects()).await;
    h.manager.start("s1", "t1").await.unwrap();
    // Generation 0 was never issued to any session.
    h.manager.reconnect("s1", 0).await;
    h.manager.reconnect("ghost", 1).await;
    assert_eq!(h.factory.open_count("s1"), 1);
    assert_eq!(h.manager.active_count().await, 1);
}

#[tokio::test]
async fn test_stop_unknown_session_is_noop() {
    let h = harness(SessionConfig::default()).await;
    h.manager.stop("nope").await;
    assert_eq!(h.manager.active_count().await, 0);
}

#[tokio::test]
async fn test_exhausted_attempts_keep_credentials() {
    let mut h = harness(SessionConfig {
        reconnect_step_ms: 10,
        max_reconnect_attempts: Some(1),
        ..Default::default()
    })
    .await;
    let auth = AuthStateStore::new(h.store.clone());
    auth.save_creds("s1", &Credentials(vec![9])).await;
    h.manager.start("s1", "t1").await.unwrap();

    h.close_and_retry(CloseReason::transient("network")).await;
    h.factory.wait_for_opens("s1", 2).await;
    let signal = h
        .emit(ConnectionUpdate::Close(CloseReason::transient("network")))
        .await;
    assert!(matches!(signal, SessionSignal::Closed { retry_in: None, .. }));

    assert_eq!(h.manager.state("s1").await, None);
    assert!(auth.has_creds("s1").await);
}

#[tokio::test]
async fn test_failed_open_counts_as_attempt() {
    let mut h = harness(SessionConfig {
        reconnect_step_ms: 100,
        ..Default::default()
    })
    .await;
    h.factory.fail_opens.store(true, Ordering::SeqCst);

    assert!(h.manager.start("s1", "t1").await.is_err());
    assert!(matches!(
        h.next_signal().await,
        SessionSignal::Closed { retry_in: Some(_), .. }
    ));
    assert_eq!(h.manager.attempts("s1").await, Some(1));
    assert!(h.manager.active("s1").await.is_none());

    h.factory.fail_opens.store(false, Ordering::SeqCst);
    h.factory.wait_for_opens("s1", 1).await;
    let signal = h.emit(ConnectionUpdate::Open).await;
    assert!(matches!(signal, SessionSignal::Connected { .. }));
    assert!(h.manager.active("s1").await.is_some());
}

#[tokio::test]
async fn test_restore_all_skips_logged_out_and_unpaired() {
    let h = harness(SessionConfig::default()).await;
    let auth = AuthStateStore::new(h.store.clone());
    h.store.register_instance("s1", "t1", "connected").await.unwrap();
    h.store.register_instance("s2", "t1", "logged_out").await.unwrap();
    h.store.register_instance("s3", "t2", "disconnected").await.unwrap();
    auth.save_creds("s1", &Credentials(vec![1])).await;
    auth.save_creds("s2", &Credentials(vec![1])).await;

    let started = h.manager.restore_all().await.unwrap();

    assert_eq!(started, 1);
    assert!(h.manager.state("s1").await.is_some());
    assert!(h.manager.state("s2").await.is_none());
    assert!(h.manager.state("s3").await.is_none());
}

#[tokio::test]
async fn test_tenant_session_requires_connected() {
    let mut h = harness(SessionConfig::default()).await;
    h.manager.start("s1", "t1").await.unwrap();
    assert!(h.manager.tenant_session("t1").await.is_none());

    h.emit(ConnectionUpdate::Open).await;
    let active = h.manager.tenant_session("t1").await.unwrap();
    assert_eq!(active.session_id, "s1");
    assert_eq!(active.own_phone().as_deref(), Some("5511000000000"));
    assert!(h.manager.tenant_session("t2").await.is_none());
}

#[tokio::test]
async fn test_logout_wipes_and_marks_logged_out() {
    let h = harness(SessionConfig::default()).await;
    let auth = AuthStateStore::new(h.store.clone());
    auth.save_creds("s1", &Credentials(vec![1])).await;
    h.manager.start("s1", "t1").await.unwrap();

    h.manager.logout("s1").await;

    assert_eq!(h.manager.active_count().await, 0);
    assert!(!auth.has_creds("s1").await);
    let instance = h.store.get_instance("s1").await.unwrap().unwrap();
    assert_eq!(instance.status, "logged_out");
}

#[tokio::test]
async fn test_inbound_messages_reach_ingestion() {
    let mut h = harness(SessionConfig::default()).await;
    let mut bus = h.manager.router().ingestor().bus().subscribe();
    h.manager.start("s1", "t1").await.unwrap();
    h.emit(ConnectionUpdate::Open).await;

    let message = RawMessage {
        key: MessageKey {
            remote_jid: "5511999999999@s.whatsapp.net".into(),
            id: "ABC123".into(),
            ..Default::default()
        },
        push_name: Some("Maria".into()),
        timestamp: Utc::now(),
        content: RawContent::Text("Olá".into()),
    };
    h.factory
        .emit(
            "s1",
            ProtocolEvent::Messages {
                kind: UpsertKind::Notify,
                messages: vec![message.clone(), message],
            },
        )
        .await;
    // Events are handled in order, so once this one is through the
    // messages above have been queued.
    h.emit(ConnectionUpdate::Open).await;
    h.manager.router().queue().drained().await;

    assert_eq!(h.store.count_messages("t1").await.unwrap(), 1);
    assert!(h.store.get_lead("t1", "5511999999999").await.unwrap().is_some());
    assert!(matches!(
        bus.try_recv(),
        Ok(Notification::NewMessageArrived { whatsapp_id, .. }) if whatsapp_id == "ABC123"
    ));
    assert!(bus.try_recv().is_err());
}

#[tokio::test]
async fn test_stop_all_closes_everything() {
    let h = harness(SessionConfig::default()).await;
    h.manager.start("s1", "t1").await.unwrap();
    h.manager.start("s2", "t2").await.unwrap();
    assert_eq!(h.manager.active_count().await, 2);

    h.manager.stop_all().await;
    assert_eq!(h.manager.active_count().await, 0);
    assert!(h.factory.socket.closed.load(Ordering::SeqCst));
}
