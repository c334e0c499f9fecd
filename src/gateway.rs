//! Gateway: wires the store, session manager, sender and scheduler together
//! and runs them until shutdown.

use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use wagate_core::config::{shellexpand, Config};
use wagate_core::outbound::MessageSpec;
use wagate_sessions::bus::NotificationBus;
use wagate_sessions::dispatcher::EventRouter;
use wagate_sessions::handlers::EventHandlers;
use wagate_sessions::history::HistoryBackfill;
use wagate_sessions::ingest::Ingestor;
use wagate_sessions::media::MediaStore;
use wagate_sessions::qr;
use wagate_sessions::queue::IngestQueue;
use wagate_sessions::reminders::ReminderScheduler;
use wagate_sessions::wa::WhatsAppFactory;
use wagate_sessions::webhook::WebhookDispatcher;
use wagate_sessions::whisper::Transcriber;
use wagate_sessions::{OutboundSender, SentMessage, SessionManager, SessionSignal, SessionState};
use wagate_store::Store;

/// How long one-shot commands wait for a session to come up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Capacity of the realtime notification bus.
const BUS_CAPACITY: usize = 256;

pub struct Gateway {
    config: Config,
    store: Store,
    manager: SessionManager,
    sender: OutboundSender,
    bus: NotificationBus,
}

impl Gateway {
    /// Open the store and build every component from config.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let store = Store::new(&config.store).await?;
        let data_dir = PathBuf::from(shellexpand(&config.gateway.data_dir));

        let media = if config.media.enabled {
            Some(MediaStore::new(&config.media)?)
        } else {
            None
        };
        let bus = NotificationBus::new(BUS_CAPACITY);
        let webhook = WebhookDispatcher::new(config.webhook.timeout_secs)?;

        let mut ingestor = Ingestor::new(store.clone(), bus.clone(), webhook);
        if let Some(ref media) = media {
            ingestor = ingestor.with_media(media.clone());
        }
        if let Some(transcriber) = Transcriber::from_key(config.media.whisper_api_key.as_deref()) {
            ingestor = ingestor.with_transcriber(transcriber);
        }

        let handlers = EventHandlers::new(
            store.clone(),
            Duration::from_millis(config.session.presence_debounce_ms),
        );
        let history = Arc::new(HistoryBackfill::new(
            store.clone(),
            ingestor.clone(),
            handlers.clone(),
            config.history.clone(),
        ));
        let router = EventRouter::new(
            ingestor,
            handlers,
            history,
            IngestQueue::new(config.queue.workers),
        );

        let manager = SessionManager::new(
            config.session.clone(),
            data_dir,
            store.clone(),
            Arc::new(WhatsAppFactory::new(media)),
            router,
        );
        let sender = OutboundSender::new(manager.clone(), store.clone(), config.sender.clone());

        Ok(Self {
            config,
            store,
            manager,
            sender,
            bus,
        })
    }

    /// Restore sessions, run the scheduler and wait for Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let restored = self.manager.restore_all().await?;
        info!(
            "{} running | restored sessions: {restored} | ingest workers: {}",
            self.config.gateway.name, self.config.queue.workers
        );

        let sched_handle = if self.config.scheduler.enabled {
            let scheduler = ReminderScheduler::new(
                self.store.clone(),
                self.manager.clone(),
                self.sender.clone(),
                self.config.scheduler.clone(),
            );
            Some(tokio::spawn(scheduler.run()))
        } else {
            None
        };

        let mut signals = self.manager.subscribe();
        let mut notifications = self.bus.subscribe();
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Ok(signal) => log_signal(&signal),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("session signal stream lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                notification = notifications.recv() => {
                    if let Ok(notification) = notification {
                        debug!(?notification, "new message");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown(sched_handle).await;
        Ok(())
    }

    async fn shutdown(&self, sched_handle: Option<tokio::task::JoinHandle<()>>) {
        if let Some(handle) = sched_handle {
            handle.abort();
        }
        self.manager.stop_all().await;

        let queue = self.manager.router().queue();
        let stats = queue.stats();
        if stats.pending + stats.active > 0 {
            info!("draining {} queued ingest tasks", stats.pending + stats.active);
            if tokio::time::timeout(Duration::from_secs(10), queue.drained())
                .await
                .is_err()
            {
                warn!("ingest queue did not drain in time");
            }
        }
        info!("Shutdown complete");
    }

    /// Start one session and show QR codes until it connects.
    pub async fn pair(&self, session_id: &str, company_id: &str) -> anyhow::Result<()> {
        let mut signals = self.manager.subscribe();
        self.manager.start(session_id, company_id).await?;
        println!("Waiting for WhatsApp pairing of session '{session_id}'...");

        let outcome = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match signals.recv().await {
                    Ok(SessionSignal::Qr { session_id: s, code }) if s == session_id => {
                        match qr::render_terminal(&code) {
                            Ok(rendered) => println!("\nScan with WhatsApp > Linked devices:\n\n{rendered}"),
                            Err(e) => warn!("failed to render QR: {e}"),
                        }
                    }
                    Ok(SessionSignal::Connected { session_id: s }) if s == session_id => {
                        return Ok(());
                    }
                    Ok(SessionSignal::Closed {
                        session_id: s,
                        reason,
                        retry_in: None,
                    }) if s == session_id => {
                        anyhow::bail!("session closed: {}", reason.message);
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("session manager shut down");
                    }
                }
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out waiting for pairing")),
        };
        if result.is_ok() {
            println!("Session '{session_id}' connected.");
            // Give the library a moment to persist the linked device.
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        self.manager.stop_all().await;
        result
    }

    /// Connect one session, send a single text and disconnect.
    pub async fn send_once(
        &self,
        session_id: &str,
        company_id: &str,
        to: &str,
        text: &str,
    ) -> anyhow::Result<SentMessage> {
        let mut signals = self.manager.subscribe();
        self.manager.start(session_id, company_id).await?;

        tokio::time::timeout(CONNECT_TIMEOUT, async {
            while self.manager.state(session_id).await != Some(SessionState::Connected) {
                match signals.recv().await {
                    Ok(SessionSignal::Qr { .. }) => {
                        anyhow::bail!("session '{session_id}' is not paired, run `wagate pair` first")
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("session manager shut down")
                    }
                }
            }
            Ok(())
        })
        .await
        .context("timed out waiting for the session to connect")??;

        let spec = MessageSpec::Text {
            text: Some(text.to_string()),
        };
        let sent = self.sender.send(session_id, to, &spec).await;
        self.manager.stop_all().await;
        Ok(sent?)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn log_signal(signal: &SessionSignal) {
    match signal {
        SessionSignal::Qr { session_id, .. } => {
            info!(session = %session_id, "QR code ready (see data_dir/qr)");
        }
        SessionSignal::Connected { session_id } => info!(session = %session_id, "connected"),
        SessionSignal::Closed {
            session_id,
            reason,
            retry_in,
        } => {
            if let Some(delay) = retry_in {
                info!(
                    session = %session_id,
                    "closed ({}), reconnecting in {}ms",
                    reason.message,
                    delay.as_millis()
                );
            } else {
                warn!(session = %session_id, "closed for good: {}", reason.message);
            }
        }
    }
}
