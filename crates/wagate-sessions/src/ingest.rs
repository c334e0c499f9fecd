//! Message ingestion pipeline.
//!
//! Turns one protocol message into persisted rows: contact, lead, message,
//! plus the realtime notification and tenant webhook. Every step is fail-soft
//! on its own; only the message upsert decides the outcome.

use serde_json::json;
use tracing::{debug, warn};
use wagate_core::event::{RawContent, RawMessage};
use wagate_core::jid;
use wagate_core::message::{MessageRecord, MessageStatus, MessageType, StructuredContent};
use wagate_store::{ContactPatch, Store};

use crate::bus::{Notification, NotificationBus};
use crate::media::MediaStore;
use crate::socket::ActiveSession;
use crate::webhook::WebhookDispatcher;
use crate::whisper::Transcriber;

/// Caller choices for one ingestion.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Fresh traffic (publishes notifications) vs. backfill.
    pub realtime: bool,
    pub download_media: bool,
    /// Overrides the push name, e.g. with an address-book name from backfill.
    pub forced_name: Option<String>,
}

impl IngestOptions {
    pub fn realtime() -> Self {
        Self {
            realtime: true,
            download_media: true,
            forced_name: None,
        }
    }

    pub fn backfill() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { created: bool },
    Skipped(&'static str),
}

/// The ingestion pipeline and its collaborators.
#[derive(Clone)]
pub struct Ingestor {
    store: Store,
    bus: NotificationBus,
    webhook: WebhookDispatcher,
    media: Option<MediaStore>,
    transcriber: Option<Transcriber>,
}

impl Ingestor {
    pub fn new(store: Store, bus: NotificationBus, webhook: WebhookDispatcher) -> Self {
        Self {
            store,
            bus,
            webhook,
            media: None,
            transcriber: None,
        }
    }

    pub fn with_media(mut self, media: MediaStore) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_transcriber(mut self, transcriber: Transcriber) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn ingest(
        &self,
        message: &RawMessage,
        session: &ActiveSession,
        options: &IngestOptions,
    ) -> IngestOutcome {
        let company_id = session.company_id.as_str();
        let content = message.content.unwrap_envelope();

        if jid::is_ignored_conversation(&message.key.remote_jid) {
            return IngestOutcome::Skipped("ignored conversation");
        }
        if content.is_protocol_only() {
            return IngestOutcome::Skipped("protocol message");
        }
        let message_type = content.message_type();
        let mut text = content.text();
        if message_type == MessageType::Unknown && text.is_empty() {
            return IngestOutcome::Skipped("unsupported content");
        }

        let remote_jid = resolve_conversation(
            &self.store,
            company_id,
            &message.key.remote_jid,
            message.key.remote_jid_alt.as_deref(),
        )
        .await;
        let is_group = jid::is_group(&remote_jid);
        let from_me = message.key.from_me;
        let phone = jid::phone_of(&remote_jid);
        let push_name = options
            .forced_name
            .as_deref()
            .or(message.push_name.as_deref())
            .filter(|n| !n.trim().is_empty());

        // Contacts first so downstream consumers always find the sender.
        if !is_group {
            let name = if from_me { None } else { push_name };
            let patch = ContactPatch::push_name(&remote_jid, phone.clone(), name);
            if let Err(e) = self.store.upsert_contact(company_id, &patch).await {
                warn!("ingest: contact upsert for {remote_jid} failed: {e}");
            }
        }

        let mut participant = None;
        if is_group {
            if let Some(raw) = message.key.participant.as_deref() {
                let resolved = resolve_conversation(&self.store, company_id, raw, None).await;
                if !from_me {
                    let patch = ContactPatch::push_name(
                        &resolved,
                        jid::phone_of(&resolved),
                        message.push_name.as_deref(),
                    );
                    if let Err(e) = self.store.upsert_contact(company_id, &patch).await {
                        warn!("ingest: participant upsert for {resolved} failed: {e}");
                    }
                }
                participant = Some(resolved);
            }
        }

        if self
            .store
            .is_contact_ignored(company_id, &remote_jid)
            .await
            .unwrap_or(false)
        {
            debug!("ingest: {remote_jid} is ignored for {company_id}");
            return IngestOutcome::Skipped("blocked contact");
        }

        if !is_group && !from_me {
            if let Some(phone) = phone.as_deref() {
                if session.own_phone().as_deref() != Some(phone) {
                    if let Err(e) = self.store.ensure_lead(company_id, phone, push_name).await {
                        warn!("ingest: lead for {phone} failed: {e}");
                    }
                }
            }
        }

        let mut media_url = None;
        let mut audio_bytes = None;
        if options.download_media {
            if let (Some(store), Some((kind, media))) = (self.media.as_ref(), content.media()) {
                match session.socket.download_media(kind, media).await {
                    Ok(bytes) => match store.save(company_id, &media.extension(kind), &bytes).await {
                        Ok(url) => {
                            media_url = Some(url);
                            if matches!(content, RawContent::Audio { .. }) {
                                audio_bytes = Some((bytes, media.extension(kind)));
                            }
                        }
                        Err(e) => warn!("ingest: saving media failed: {e}"),
                    },
                    // Expired or revoked media is routine.
                    Err(e) => debug!("ingest: media download for {} failed: {e}", message.key.id),
                }
            }
        }

        let structured = structured_content(content);
        if text.is_empty() {
            text = message_type.as_str().to_string();
        }

        let record = MessageRecord {
            company_id: company_id.to_string(),
            session_id: session.session_id.clone(),
            remote_jid: remote_jid.clone(),
            whatsapp_id: message.key.id.clone(),
            from_me,
            participant,
            content: text.clone(),
            message_type,
            media_url: media_url.clone(),
            status: if from_me {
                MessageStatus::Sent
            } else {
                MessageStatus::Delivered
            },
            structured,
            created_at: message.timestamp,
        };

        let created = match self.store.upsert_message(&record).await {
            Ok(created) => created,
            Err(e) => {
                warn!("ingest: message {} not stored: {e}", record.whatsapp_id);
                return IngestOutcome::Skipped("store failure");
            }
        };

        if let (Some((bytes, ext)), Some(transcriber)) = (audio_bytes, self.transcriber.clone()) {
            let store = self.store.clone();
            let company = company_id.to_string();
            let chat = record.remote_jid.clone();
            let whatsapp_id = record.whatsapp_id.clone();
            tokio::spawn(async move {
                match transcriber.transcribe(&bytes, &ext).await {
                    Ok(transcript) if !transcript.trim().is_empty() => {
                        if let Err(e) = store
                            .set_message_content(&company, &chat, &whatsapp_id, transcript.trim())
                            .await
                        {
                            warn!("transcript for {whatsapp_id} not saved: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("transcription of {whatsapp_id} failed: {e}"),
                }
            });
        }

        if options.realtime && created && !from_me && !is_group {
            self.bus.publish(Notification::NewMessageArrived {
                company_id: company_id.to_string(),
                session_id: session.session_id.clone(),
                remote_jid: remote_jid.clone(),
                whatsapp_id: record.whatsapp_id.clone(),
                phone: phone.clone(),
                push_name: push_name.map(str::to_string),
                content: text,
                timestamp: record.created_at,
            });
        }

        if created {
            match self.store.webhook_url(company_id).await {
                Ok(Some(url)) => self.webhook.dispatch(url, webhook_payload(&record)),
                Ok(None) => {}
                Err(e) => warn!("ingest: webhook lookup for {company_id} failed: {e}"),
            }
        }

        IngestOutcome::Stored { created }
    }
}

/// Map an alias JID to its phone form when known; anything else is
/// normalized and returned as is. A phone-form `alt` seeds the identity map
/// but never replaces a mapping recorded earlier.
pub(crate) async fn resolve_conversation(
    store: &Store,
    company_id: &str,
    raw: &str,
    alt: Option<&str>,
) -> String {
    let normalized = jid::normalize(raw);
    if !jid::is_lid(&normalized) {
        return normalized;
    }
    let alt = alt.map(jid::normalize).filter(|a| jid::phone_of(a).is_some());
    if let Some(alt) = alt.as_deref() {
        if let Err(e) = store.put_identity(company_id, &normalized, alt).await {
            warn!("alias {normalized} not recorded: {e}");
        }
    }
    match store.resolve_alias(company_id, &normalized).await {
        Ok(Some(phone_jid)) => phone_jid,
        Ok(None) => alt.unwrap_or(normalized),
        Err(e) => {
            warn!("alias lookup for {normalized} failed: {e}");
            alt.unwrap_or(normalized)
        }
    }
}

fn structured_content(content: &RawContent) -> Option<StructuredContent> {
    match content {
        RawContent::PollCreation {
            name,
            options,
            selectable_count,
        } => Some(StructuredContent::Poll {
            name: name.clone(),
            options: options.clone(),
            selectable_count: *selectable_count,
        }),
        RawContent::Location {
            latitude,
            longitude,
            name,
            address,
        } => Some(StructuredContent::Location {
            latitude: *latitude,
            longitude: *longitude,
            name: name.clone(),
            address: address.clone(),
        }),
        RawContent::ContactCard {
            display_name,
            vcard,
        } => Some(StructuredContent::Contact {
            display_name: display_name.clone(),
            vcard: vcard.clone(),
        }),
        _ => None,
    }
}

fn webhook_payload(record: &MessageRecord) -> serde_json::Value {
    json!({
        "event": "message",
        "company_id": record.company_id,
        "session_id": record.session_id,
        "message": {
            "remote_jid": record.remote_jid,
            "whatsapp_id": record.whatsapp_id,
            "from_me": record.from_me,
            "participant": record.participant,
            "content": record.content,
            "message_type": record.message_type,
            "media_url": record.media_url,
            "structured": record.structured,
            "timestamp": record.created_at.timestamp(),
        }
    })
}
