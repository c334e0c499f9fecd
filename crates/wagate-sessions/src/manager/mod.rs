//! Connection manager.
//!
//! Owns the session map: one protocol connection per session id, its
//! lifecycle state, the reconnect policy and the tenant-visible status row.
//! Each connection gets a generation number; events and timers carrying an
//! older generation are ignored, so a dead socket or a reconnect timer that
//! outlived `stop()` can never act on the current session.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wagate_core::config::SessionConfig;
use wagate_core::error::GatewayError;
use wagate_core::event::{CloseReason, ConnectionUpdate, ProtocolEvent};
use wagate_core::jid;
use wagate_store::{Store, STATUS_CONNECTING, STATUS_DISCONNECTED, STATUS_LOGGED_OUT};

use crate::auth::AuthStateStore;
use crate::dispatcher::EventRouter;
use crate::qr;
use crate::socket::{ActiveSession, ProtocolSocket, SocketContext, SocketFactory};

const EVENT_BUFFER: usize = 256;

/// Lifecycle state of a session held by the manager. A closed session is
/// simply absent from the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingScan,
    Connected,
}

/// Lifecycle notifications for operators (CLI pairing, logs).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Qr {
        session_id: String,
        code: String,
    },
    Connected {
        session_id: String,
    },
    Closed {
        session_id: String,
        reason: CloseReason,
        /// Delay until the next attempt; `None` when the session is gone.
        retry_in: Option<Duration>,
    },
}

struct SessionEntry {
    company_id: String,
    socket: Option<Arc<dyn ProtocolSocket>>,
    state: SessionState,
    attempts: u32,
    generation: u64,
    reconnect: Option<JoinHandle<()>>,
    own_jid: Option<String>,
}

impl SessionEntry {
    fn new(company_id: &str, generation: u64) -> Self {
        Self {
            company_id: company_id.to_string(),
            socket: None,
            state: SessionState::Connecting,
            attempts: 0,
            generation,
            reconnect: None,
            own_jid: None,
        }
    }

    fn active(&self, session_id: &str) -> Option<ActiveSession> {
        self.socket.as_ref().map(|socket| ActiveSession {
            session_id: session_id.to_string(),
            company_id: self.company_id.clone(),
            socket: socket.clone(),
            own_jid: self.own_jid.clone(),
        })
    }
}

/// What a close event leads to, decided under the map lock.
enum CloseOutcome {
    Stale,
    Removed {
        company_id: String,
        socket: Option<Arc<dyn ProtocolSocket>>,
        wipe: bool,
    },
    Retrying {
        socket: Option<Arc<dyn ProtocolSocket>>,
        attempt: u32,
        delay: Duration,
    },
}

struct ManagerInner {
    config: SessionConfig,
    data_dir: PathBuf,
    store: Store,
    auth: AuthStateStore,
    factory: Arc<dyn SocketFactory>,
    router: EventRouter,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    signals: broadcast::Sender<SessionSignal>,
    generations: AtomicU64,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        data_dir: impl Into<PathBuf>,
        store: Store,
        factory: Arc<dyn SocketFactory>,
        router: EventRouter,
    ) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                data_dir: data_dir.into(),
                auth: AuthStateStore::new(store.clone()),
                store,
                factory,
                router,
                sessions: Mutex::new(HashMap::new()),
                signals,
                generations: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.inner.signals.subscribe()
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn signal(&self, signal: SessionSignal) {
        let _ = self.inner.signals.send(signal);
    }

    /// Start a session. Starting an id that is already held is a no-op.
    ///
    /// A failed connection attempt is handled like a transient close: the
    /// session stays registered with a reconnect pending, and the error is
    /// returned to the caller.
    pub async fn start(&self, session_id: &str, company_id: &str) -> Result<(), GatewayError> {
        let generation = {
            let mut sessions = self.inner.sessions.lock().await;
            if sessions.contains_key(session_id) {
                debug!(session = session_id, "start ignored, session already active");
                return Ok(());
            }
            let generation = self.next_generation();
            sessions.insert(
                session_id.to_string(),
                SessionEntry::new(company_id, generation),
            );
            generation
        };

        info!(session = session_id, tenant = company_id, "starting session");
        if let Err(e) = self
            .inner
            .store
            .register_instance(session_id, company_id, STATUS_CONNECTING)
            .await
        {
            warn!(session = session_id, "failed to register instance: {e}");
        }
        self.connect(session_id, generation).await
    }

    async fn connect(&self, session_id: &str, generation: u64) -> Result<(), GatewayError> {
        let company_id = {
            let sessions = self.inner.sessions.lock().await;
            match sessions.get(session_id) {
                Some(entry) if entry.generation == generation => entry.company_id.clone(),
                _ => return Ok(()),
            }
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let ctx = SocketContext {
            session_id: session_id.to_string(),
            company_id,
            device_name: self.inner.config.device_name.clone(),
            auth: self.inner.auth.clone(),
            store: self.inner.store.clone(),
        };
        let socket = match self.inner.factory.open(ctx, tx).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(session = session_id, "connection attempt failed: {e}");
                self.on_close(session_id, generation, CloseReason::transient(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        // The dispatcher starts under the lock so it never sees an entry
        // without its socket.
        let orphan = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(entry) if entry.generation == generation => {
                    entry.socket = Some(socket.clone());
                    self.spawn_dispatcher(session_id.to_string(), generation, rx);
                    false
                }
                _ => true,
            }
        };
        if orphan {
            debug!(session = session_id, "session stopped while connecting");
            socket.close().await;
        }
        Ok(())
    }

    fn spawn_dispatcher(
        &self,
        session_id: String,
        generation: u64,
        mut rx: mpsc::Receiver<ProtocolEvent>,
    ) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = SessionManager { inner };
                if !manager.handle_event(&session_id, generation, event).await {
                    break;
                }
            }
            debug!(session = %session_id, generation, "event loop finished");
        });
    }

    /// Returns `false` once this connection is no longer the session's current one.
    async fn handle_event(&self, session_id: &str, generation: u64, event: ProtocolEvent) -> bool {
        match event {
            ProtocolEvent::Connection(update) => {
                self.on_connection(session_id, generation, update).await
            }
            ProtocolEvent::CredentialsRotated => {
                debug!(session = session_id, "credentials rotated");
                self.current(session_id, generation).await.is_some()
            }
            other => match self.current(session_id, generation).await {
                Some(active) => {
                    self.inner.router.route(active, other).await;
                    true
                }
                None => false,
            },
        }
    }

    async fn current(&self, session_id: &str, generation: u64) -> Option<ActiveSession> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(session_id)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.active(session_id))
    }

    async fn on_connection(
        &self,
        session_id: &str,
        generation: u64,
        update: ConnectionUpdate,
    ) -> bool {
        match update {
            ConnectionUpdate::Qr(code) => self.on_qr(session_id, generation, code).await,
            ConnectionUpdate::Open => self.on_open(session_id, generation).await,
            ConnectionUpdate::Close(reason) => {
                self.on_close(session_id, generation, reason).await;
                false
            }
        }
    }

    async fn on_qr(&self, session_id: &str, generation: u64, code: String) -> bool {
        {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(entry) if entry.generation == generation => {
                    entry.state = SessionState::AwaitingScan;
                }
                _ => return false,
            }
        }

        if let Err(e) = self.inner.store.set_instance_qr(session_id, &code).await {
            warn!(session = session_id, "failed to persist QR: {e}");
        }
        match qr::write_png(&self.inner.data_dir, session_id, &code).await {
            Ok(path) => info!(session = session_id, "QR code ready at {}", path.display()),
            Err(e) => warn!(session = session_id, "failed to write QR image: {e}"),
        }
        if let Ok(rendered) = qr::render_terminal(&code) {
            debug!(session = session_id, "scan to pair:\n{rendered}");
        }
        self.signal(SessionSignal::Qr {
            session_id: session_id.to_string(),
            code,
        });
        true
    }

    async fn on_open(&self, session_id: &str, generation: u64) -> bool {
        let socket = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(entry) if entry.generation == generation => {
                    entry.state = SessionState::Connected;
                    entry.attempts = 0;
                    entry.socket.clone()
                }
                _ => return false,
            }
        };

        info!(session = session_id, "connected");
        if let Err(e) = self.inner.store.mark_instance_connected(session_id).await {
            warn!(session = session_id, "failed to persist connected status: {e}");
        }

        if let Some(socket) = socket {
            match socket.own_profile().await {
                Ok(profile) => {
                    let own_jid = profile.jid.as_deref().map(jid::normalize);
                    {
                        let mut sessions = self.inner.sessions.lock().await;
                        if let Some(entry) = sessions
                            .get_mut(session_id)
                            .filter(|e| e.generation == generation)
                        {
                            entry.own_jid = own_jid.clone();
                        }
                    }
                    if let Err(e) = self
                        .inner
                        .store
                        .set_instance_profile(
                            session_id,
                            own_jid.as_deref(),
                            profile.name.as_deref(),
                            profile.picture_url.as_deref(),
                        )
                        .await
                    {
                        debug!(session = session_id, "profile not saved: {e}");
                    }
                }
                Err(e) => debug!(session = session_id, "profile fetch failed: {e}"),
            }
        }

        self.signal(SessionSignal::Connected {
            session_id: session_id.to_string(),
        });
        true
    }

    async fn on_close(&self, session_id: &str, generation: u64, reason: CloseReason) {
        let fatal = reason.is_fatal(&self.inner.config.fatal_close_codes);
        let outcome = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(entry) if entry.generation == generation => {
                    if !fatal {
                        entry.attempts += 1;
                    }
                    let exhausted = self
                        .inner
                        .config
                        .max_reconnect_attempts
                        .is_some_and(|max| entry.attempts > max);
                    if fatal || exhausted {
                        match sessions.remove(session_id) {
                            Some(mut entry) => {
                                if let Some(timer) = entry.reconnect.take() {
                                    timer.abort();
                                }
                                CloseOutcome::Removed {
                                    company_id: entry.company_id,
                                    socket: entry.socket,
                                    wipe: fatal,
                                }
                            }
                            None => CloseOutcome::Stale,
                        }
                    } else {
                        let next = self.next_generation();
                        let delay = self.inner.config.reconnect_delay(entry.attempts);
                        entry.generation = next;
                        entry.state = SessionState::Connecting;
                        if let Some(timer) = entry.reconnect.take() {
                            timer.abort();
                        }
                        entry.reconnect = Some(self.spawn_reconnect(session_id, next, delay));
                        CloseOutcome::Retrying {
                            socket: entry.socket.take(),
                            attempt: entry.attempts,
                            delay,
                        }
                    }
                }
                _ => CloseOutcome::Stale,
            }
        };

        match outcome {
            CloseOutcome::Stale => {
                debug!(session = session_id, generation, "close for a stale connection ignored");
            }
            CloseOutcome::Removed {
                company_id,
                socket,
                wipe,
            } => {
                if let Some(socket) = socket {
                    socket.close().await;
                }
                self.persist_status(session_id, STATUS_DISCONNECTED).await;
                if wipe {
                    warn!(
                        session = session_id,
                        tenant = %company_id,
                        "connection closed for good ({}), wiping credentials",
                        reason.message
                    );
                    self.inner.auth.clear(session_id).await;
                } else {
                    warn!(
                        session = session_id,
                        tenant = %company_id,
                        "giving up after repeated reconnect failures"
                    );
                }
                self.signal(SessionSignal::Closed {
                    session_id: session_id.to_string(),
                    reason,
                    retry_in: None,
                });
            }
            CloseOutcome::Retrying {
                socket,
                attempt,
                delay,
            } => {
                if let Some(socket) = socket {
                    socket.close().await;
                }
                self.persist_status(session_id, STATUS_DISCONNECTED).await;
                info!(
                    session = session_id,
                    attempt,
                    "connection closed ({}), reconnecting in {}ms",
                    reason.message,
                    delay.as_millis()
                );
                self.signal(SessionSignal::Closed {
                    session_id: session_id.to_string(),
                    reason,
                    retry_in: Some(delay),
                });
            }
        }
    }

    fn spawn_reconnect(&self, session_id: &str, generation: u64, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }.reconnect(&session_id, generation).await;
            }
        })
    }

    /// Timer body. Only acts if the session is still held under this generation.
    async fn reconnect(&self, session_id: &str, generation: u64) {
        {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(entry) if entry.generation == generation => {
                    entry.reconnect = None;
                }
                _ => {
                    debug!(session = session_id, "reconnect dropped, session no longer held");
                    return;
                }
            }
        }
        self.persist_status(session_id, STATUS_CONNECTING).await;
        if let Err(e) = self.connect(session_id, generation).await {
            debug!(session = session_id, "reconnect attempt failed: {e}");
        }
    }

    async fn persist_status(&self, session_id: &str, status: &str) {
        if let Err(e) = self
            .inner
            .store
            .set_instance_status(session_id, status)
            .await
        {
            warn!(session = session_id, "failed to persist status {status}: {e}");
        }
    }

    /// Stop a session: cancel its reconnect timer, close the socket and drop
    /// it from the map. Unknown ids are ignored.
    pub async fn stop(&self, session_id: &str) {
        let entry = self.inner.sessions.lock().await.remove(session_id);
        let Some(mut entry) = entry else {
            debug!(session = session_id, "stop ignored, session not active");
            return;
        };
        if let Some(timer) = entry.reconnect.take() {
            timer.abort();
        }
        if let Some(socket) = entry.socket.take() {
            socket.close().await;
        }
        self.persist_status(session_id, STATUS_DISCONNECTED).await;
        info!(session = session_id, tenant = %entry.company_id, "session stopped");
    }

    /// Stop and forget the pairing: credentials are wiped and the instance
    /// is marked logged out.
    pub async fn logout(&self, session_id: &str) {
        self.stop(session_id).await;
        self.inner.auth.clear(session_id).await;
        self.persist_status(session_id, STATUS_LOGGED_OUT).await;
        info!(session = session_id, "session logged out");
    }

    /// Start every known instance that still has credentials and was not
    /// logged out. Returns how many were started.
    pub async fn restore_all(&self) -> Result<usize, GatewayError> {
        let instances = self.inner.store.list_instances().await?;
        let mut started = 0;
        for instance in instances {
            if instance.status == STATUS_LOGGED_OUT {
                continue;
            }
            if !self.inner.auth.has_creds(&instance.session_id).await {
                debug!(session = %instance.session_id, "not restoring, no credentials");
                continue;
            }
            match self.start(&instance.session_id, &instance.company_id).await {
                Ok(()) => started += 1,
                Err(e) => warn!(session = %instance.session_id, "restore failed: {e}"),
            }
        }
        info!("restored {started} sessions");
        Ok(started)
    }

    /// The live session under this id, if it has a socket.
    pub async fn active(&self, session_id: &str) -> Option<ActiveSession> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(session_id).and_then(|e| e.active(session_id))
    }

    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|e| e.state)
    }

    /// Consecutive failed connection cycles of a session.
    pub async fn attempts(&self, session_id: &str) -> Option<u32> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|e| e.attempts)
    }

    /// First connected session of a tenant, by session id.
    pub async fn tenant_session(&self, company_id: &str) -> Option<ActiveSession> {
        let sessions = self.inner.sessions.lock().await;
        let mut candidates: Vec<(&String, &SessionEntry)> = sessions
            .iter()
            .filter(|(_, e)| e.company_id == company_id && e.state == SessionState::Connected)
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(b.0));
        candidates
            .into_iter()
            .find_map(|(id, entry)| entry.active(id))
    }

    pub async fn active_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}
