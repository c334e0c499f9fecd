//! Hand-written protocol fakes for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use wagate_core::error::GatewayError;
use wagate_core::event::{ChatPresence, MediaKind, MediaRef, ProtocolEvent};
use wagate_core::outbound::OutboundPayload;
use wagate_store::Store;

use crate::socket::{ActiveSession, OwnProfile, ProtocolSocket, SocketContext, SocketFactory};

pub struct FakeSocket {
    pub sent: Mutex<Vec<(String, OutboundPayload)>>,
    pub presences: Mutex<Vec<(String, ChatPresence)>>,
    /// `None` makes the existence check fail.
    pub exists: Option<bool>,
    pub reject_copy_code: bool,
    pub fail_sends: AtomicBool,
    pub picture: Option<String>,
    pub media: Vec<u8>,
    pub profile: OwnProfile,
    pub picture_lookups: AtomicUsize,
    pub closed: AtomicBool,
}

impl Default for FakeSocket {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            presences: Mutex::new(Vec::new()),
            exists: Some(true),
            reject_copy_code: false,
            fail_sends: AtomicBool::new(false),
            picture: None,
            media: b"media-bytes".to_vec(),
            profile: OwnProfile {
                jid: Some("5511000000000@s.whatsapp.net".into()),
                name: Some("Loja".into()),
                picture_url: Some("https://pps.example/self.jpg".into()),
            },
            picture_lookups: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl FakeSocket {
    pub fn sent(&self) -> Vec<(String, OutboundPayload)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn presences(&self) -> Vec<ChatPresence> {
        self.presences
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait]
impl ProtocolSocket for FakeSocket {
    async fn send(&self, jid: &str, payload: &OutboundPayload) -> Result<String, GatewayError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(GatewayError::Protocol("send failed".into()));
        }
        if self.reject_copy_code && matches!(payload, OutboundPayload::CopyCode { .. }) {
            return Err(GatewayError::Protocol("interactive messages unsupported".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((jid.to_string(), payload.clone()));
        Ok(format!("OUT{}", sent.len()))
    }

    async fn send_presence(&self, jid: &str, presence: ChatPresence) -> Result<(), GatewayError> {
        self.presences
            .lock()
            .unwrap()
            .push((jid.to_string(), presence));
        Ok(())
    }

    async fn on_whatsapp(&self, _phone: &str) -> Result<bool, GatewayError> {
        self.exists
            .ok_or_else(|| GatewayError::Protocol("usync timeout".into()))
    }

    async fn profile_picture_url(&self, _jid: &str) -> Result<Option<String>, GatewayError> {
        self.picture_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.picture.clone())
    }

    async fn download_media(
        &self,
        _kind: MediaKind,
        _media: &MediaRef,
    ) -> Result<Vec<u8>, GatewayError> {
        Ok(self.media.clone())
    }

    async fn own_profile(&self) -> Result<OwnProfile, GatewayError> {
        Ok(self.profile.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out one shared fake socket and keeping every event sender.
#[derive(Default)]
pub struct FakeFactory {
    pub socket: Arc<FakeSocket>,
    senders: Mutex<HashMap<String, Vec<mpsc::Sender<ProtocolEvent>>>>,
    opened_at: Mutex<HashMap<String, Vec<Instant>>>,
    opened: Notify,
    pub fail_opens: AtomicBool,
}

impl FakeFactory {
    pub fn with_socket(socket: FakeSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            ..Default::default()
        }
    }

    pub fn open_count(&self, session_id: &str) -> usize {
        self.senders
            .lock()
            .unwrap()
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// When the `n`th connection (zero based) of a session was opened.
    pub fn opened_at(&self, session_id: &str, n: usize) -> Instant {
        self.opened_at.lock().unwrap()[session_id][n]
    }

    /// Wait until a session has been opened at least `n` times.
    pub async fn wait_for_opens(&self, session_id: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.opened.notified();
                if self.open_count(session_id) >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "{session_id} opened {} times, wanted {n}",
                self.open_count(session_id)
            )
        });
    }

    /// Push an event through the most recent connection of a session.
    pub async fn emit(&self, session_id: &str, event: ProtocolEvent) {
        let tx = self
            .senders
            .lock()
            .unwrap()
            .get(session_id)
            .and_then(|v| v.last().cloned())
            .expect("session was never opened");
        tx.send(event).await.expect("dispatcher gone");
    }
}

#[async_trait]
impl SocketFactory for FakeFactory {
    async fn open(
        &self,
        ctx: SocketContext,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolSocket>, GatewayError> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(GatewayError::Protocol("connect refused".into()));
        }
        self.opened_at
            .lock()
            .unwrap()
            .entry(ctx.session_id.clone())
            .or_default()
            .push(Instant::now());
        self.senders
            .lock()
            .unwrap()
            .entry(ctx.session_id)
            .or_default()
            .push(events);
        self.opened.notify_waiters();
        Ok(self.socket.clone())
    }
}

pub async fn test_store() -> Store {
    Store::in_memory().await.unwrap()
}

pub fn active_session(socket: Arc<FakeSocket>) -> ActiveSession {
    ActiveSession {
        session_id: "s1".into(),
        company_id: "t1".into(),
        socket,
        own_jid: Some("5511000000000@s.whatsapp.net".into()),
    }
}

/// A router wired to the given store, with a quiet history config.
pub fn test_router(store: &Store) -> crate::dispatcher::EventRouter {
    use crate::bus::NotificationBus;
    use crate::handlers::EventHandlers;
    use crate::history::HistoryBackfill;
    use crate::ingest::Ingestor;
    use crate::queue::IngestQueue;
    use crate::webhook::WebhookDispatcher;
    use wagate_core::config::HistoryConfig;

    let ingestor = Ingestor::new(
        store.clone(),
        NotificationBus::default(),
        WebhookDispatcher::new(1).unwrap(),
    );
    let handlers = EventHandlers::new(store.clone(), Duration::from_millis(10));
    let history = HistoryBackfill::new(
        store.clone(),
        ingestor.clone(),
        handlers.clone(),
        HistoryConfig {
            contact_batch_pause_ms: 0,
            chat_pause_ms: 0,
            ..Default::default()
        },
    );
    crate::dispatcher::EventRouter::new(ingestor, handlers, Arc::new(history), IngestQueue::new(4))
}
