//! History backfill: bulk import of contacts and recent messages delivered
//! in chunks after pairing.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use wagate_core::config::HistoryConfig;
use wagate_core::event::{HistoryChunk, RawMessage};
use wagate_core::jid;
use wagate_store::{ContactPatch, Store};

use crate::handlers::EventHandlers;
use crate::ingest::{resolve_conversation, IngestOptions, IngestOutcome, Ingestor};
use crate::socket::ActiveSession;

/// What one chunk produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub duplicate: bool,
    pub contacts: usize,
    pub messages: usize,
    pub progress: u8,
}

pub struct HistoryBackfill {
    store: Store,
    ingestor: Ingestor,
    handlers: EventHandlers,
    config: HistoryConfig,
    seen: Mutex<HashSet<(String, u32)>>,
    /// Per-session run lock; the flag is set once the final chunk landed.
    runs: Mutex<HashMap<String, Arc<tokio::sync::Mutex<bool>>>>,
}

impl HistoryBackfill {
    pub fn new(
        store: Store,
        ingestor: Ingestor,
        handlers: EventHandlers,
        config: HistoryConfig,
    ) -> Self {
        Self {
            store,
            ingestor,
            handlers,
            config,
            seen: Mutex::new(HashSet::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn session_run(&self, session_id: &str) -> Arc<tokio::sync::Mutex<bool>> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Import one chunk. Chunks of the same session run one at a time, and
    /// once the final chunk is in, late chunks still import but no longer
    /// touch the sync status.
    pub async fn on_history_chunk(
        &self,
        chunk: &HistoryChunk,
        session: &ActiveSession,
    ) -> BackfillReport {
        let run = self.session_run(&session.session_id);
        let mut completed = run.lock().await;

        let key = (session.session_id.clone(), chunk.sequence);
        let fresh = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
        if !fresh {
            debug!(
                "history chunk {} for {} already processed",
                chunk.sequence, session.session_id
            );
            return BackfillReport {
                duplicate: true,
                ..Default::default()
            };
        }

        let progress = if chunk.is_latest {
            100
        } else {
            estimate_progress(chunk)
        };
        if chunk.is_latest {
            *completed = true;
            self.write_progress(&session.session_id, progress, true).await;
        } else if !*completed {
            self.write_progress(&session.session_id, progress, false).await;
        } else {
            debug!(
                "late history chunk {} for {} after completion",
                chunk.sequence, session.session_id
            );
        }

        let contacts = self.import_contacts(chunk, session).await;
        let messages = self.import_messages(&chunk.messages, session).await;

        if chunk.is_latest {
            self.seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(s, _)| s != &session.session_id);
            info!(
                "history backfill complete for {} ({contacts} contacts, {messages} messages in last chunk)",
                session.session_id
            );
        }

        BackfillReport {
            duplicate: false,
            contacts,
            messages,
            progress,
        }
    }

    async fn write_progress(&self, session_id: &str, percent: u8, completed: bool) {
        let status = if completed { "completed" } else { "syncing" };
        if let Err(e) = self.store.set_sync_progress(session_id, status, percent).await {
            warn!("sync progress for {session_id} not saved: {e}");
        }
    }

    async fn import_contacts(&self, chunk: &HistoryChunk, session: &ActiveSession) -> usize {
        let own_phone = session.own_phone();
        let batch_size = self.config.contact_batch_size.max(1);
        let mut written = 0;
        for (i, batch) in chunk.contacts.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.contact_batch_pause_ms)).await;
            }
            written += self
                .handlers
                .on_contacts(&session.company_id, batch, own_phone.as_deref())
                .await;
            for contact in batch {
                self.fill_missing_photo(session, &contact.id).await;
            }
        }
        written
    }

    /// Best-effort avatar lookup for contacts stored without one.
    async fn fill_missing_photo(&self, session: &ActiveSession, raw_jid: &str) {
        let contact_jid = resolve_conversation(&self.store, &session.company_id, raw_jid, None).await;
        if jid::phone_of(&contact_jid).is_none() {
            return;
        }
        let missing = matches!(
            self.store.get_contact(&session.company_id, &contact_jid).await,
            Ok(Some(c)) if c.profile_pic_url.is_none()
        );
        if !missing {
            return;
        }
        match session.socket.profile_picture_url(&contact_jid).await {
            Ok(Some(url)) => {
                let patch = ContactPatch {
                    profile_pic_url: Some(url),
                    ..ContactPatch::push_name(&contact_jid, None, None)
                };
                if let Err(e) = self.store.upsert_contact(&session.company_id, &patch).await {
                    debug!("photo for {contact_jid} not saved: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => debug!("photo lookup for {contact_jid} failed: {e}"),
        }
    }

    async fn import_messages(&self, messages: &[RawMessage], session: &ActiveSession) -> usize {
        let selected = select_for_backfill(
            messages,
            self.config.retention_days,
            self.config.per_chat_limit,
        );
        let options = IngestOptions::backfill();
        let mut stored = 0;
        for (i, chat) in selected.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.chat_pause_ms)).await;
            }
            for message in chat {
                if let IngestOutcome::Stored { created: true } =
                    self.ingestor.ingest(message, session, &options).await
                {
                    stored += 1;
                }
            }
        }
        stored
    }
}

/// Progress when the source gives none: five points per chunk, never 100
/// before the final chunk.
fn estimate_progress(chunk: &HistoryChunk) -> u8 {
    chunk
        .progress
        .map(|p| p.min(99))
        .unwrap_or_else(|| ((chunk.sequence as u64 + 1) * 5).min(99) as u8)
}

/// Group by conversation, drop anything past the retention horizon, keep
/// the newest `per_chat_limit` per conversation and return each group
/// oldest-first.
fn select_for_backfill(
    messages: &[RawMessage],
    retention_days: i64,
    per_chat_limit: usize,
) -> Vec<Vec<&RawMessage>> {
    let cutoff = Utc::now() - ChronoDuration::days(retention_days);
    let mut chats: BTreeMap<String, Vec<&RawMessage>> = BTreeMap::new();
    for message in messages.iter().filter(|m| m.timestamp >= cutoff) {
        chats
            .entry(jid::normalize(&message.key.remote_jid))
            .or_default()
            .push(message);
    }
    chats
        .into_values()
        .map(|mut chat| {
            chat.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            chat.truncate(per_chat_limit);
            chat.reverse();
            chat
        })
        .collect()
}
