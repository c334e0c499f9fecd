//! Routes non-connection protocol events of a live session to their handlers.

use std::sync::Arc;
use tracing::debug;
use wagate_core::event::{ProtocolEvent, UpsertKind};

use crate::handlers::EventHandlers;
use crate::history::HistoryBackfill;
use crate::ingest::{IngestOptions, Ingestor};
use crate::queue::IngestQueue;
use crate::socket::ActiveSession;

#[derive(Clone)]
pub struct EventRouter {
    ingestor: Ingestor,
    handlers: EventHandlers,
    history: Arc<HistoryBackfill>,
    queue: IngestQueue,
}

impl EventRouter {
    pub fn new(
        ingestor: Ingestor,
        handlers: EventHandlers,
        history: Arc<HistoryBackfill>,
        queue: IngestQueue,
    ) -> Self {
        Self {
            ingestor,
            handlers,
            history,
            queue,
        }
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    #[cfg(test)]
    pub(crate) fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub async fn route(&self, session: ActiveSession, event: ProtocolEvent) {
        let company_id = session.company_id.clone();
        match event {
            ProtocolEvent::Messages { kind, messages } => {
                let options = match kind {
                    UpsertKind::Notify => IngestOptions::realtime(),
                    UpsertKind::Append => IngestOptions::backfill(),
                };
                for message in messages {
                    let ingestor = self.ingestor.clone();
                    let session = session.clone();
                    let options = options.clone();
                    let label = format!("{}:{}", session.session_id, message.key.id);
                    self.queue.enqueue(label, async move {
                        ingestor.ingest(&message, &session, &options).await;
                        Ok(())
                    });
                }
            }
            ProtocolEvent::ContactsUpsert(contacts) => {
                let own_phone = session.own_phone();
                self.handlers
                    .on_contacts(&company_id, &contacts, own_phone.as_deref())
                    .await;
            }
            ProtocolEvent::Presence(update) => {
                self.handlers
                    .on_presence(&company_id, &session.session_id, update);
            }
            ProtocolEvent::Receipts(receipts) => {
                self.handlers.on_receipts(&company_id, &receipts).await;
            }
            ProtocolEvent::Reactions(reactions) => {
                self.handlers.on_reactions(&company_id, &reactions).await;
            }
            ProtocolEvent::PollVotes(votes) => {
                self.handlers.on_poll_votes(&company_id, &votes).await;
            }
            ProtocolEvent::HistoryChunk(chunk) => {
                // Backfill paces itself with sleeps; keep it off the event loop.
                let history = self.history.clone();
                tokio::spawn(async move {
                    history.on_history_chunk(&chunk, &session).await;
                });
            }
            ProtocolEvent::IdentityMapping { alias, phone } => {
                self.handlers
                    .on_identity_mapping(&company_id, &alias, &phone)
                    .await;
            }
            ProtocolEvent::Connection(_) | ProtocolEvent::CredentialsRotated => {
                debug!("connection event reached the router for {}", session.session_id);
            }
        }
    }
}
