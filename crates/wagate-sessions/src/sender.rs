//! Outbound sender with humanized pacing.
//!
//! Every send goes: validate, resolve the destination, existence check
//! (fail-open unless strict), random initial delay, typing or recording
//! presence held in proportion to the visible text, paused presence, then
//! the type-specific dispatch. The sent message is recorded as an outbound
//! row so receipts can advance it.

use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};
use wagate_core::config::SenderConfig;
use wagate_core::error::GatewayError;
use wagate_core::event::ChatPresence;
use wagate_core::jid;
use wagate_core::message::{MessageRecord, MessageStatus, StructuredContent};
use wagate_core::outbound::{MessageSpec, OutboundPayload};
use wagate_store::Store;

use crate::manager::SessionManager;
use crate::socket::ActiveSession;

/// Handle for a dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
    pub jid: String,
    /// The interactive form failed and plain text went out instead.
    pub fallback_used: bool,
}

#[derive(Clone)]
pub struct OutboundSender {
    manager: SessionManager,
    store: Store,
    config: SenderConfig,
}

impl OutboundSender {
    pub fn new(manager: SessionManager, store: Store, config: SenderConfig) -> Self {
        Self {
            manager,
            store,
            config,
        }
    }

    /// Send through a session held by the manager.
    pub async fn send(
        &self,
        session_id: &str,
        destination: &str,
        spec: &MessageSpec,
    ) -> Result<SentMessage, GatewayError> {
        let payload = spec.validate()?;
        let session = self
            .manager
            .active(session_id)
            .await
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;
        self.send_payload(&session, destination, payload).await
    }

    /// Send an already validated payload through a resolved session.
    pub async fn send_payload(
        &self,
        session: &ActiveSession,
        destination: &str,
        payload: OutboundPayload,
    ) -> Result<SentMessage, GatewayError> {
        let target = jid::destination_jid(destination)?;
        if !jid::is_group(&target) {
            self.check_recipient(session, &target).await?;
        }

        tokio::time::sleep(self.initial_delay()).await;
        let presence = if payload.is_voice() {
            ChatPresence::Recording
        } else {
            ChatPresence::Composing
        };
        if let Err(e) = session.socket.send_presence(&target, presence).await {
            debug!("presence to {target} failed: {e}");
        }
        tokio::time::sleep(self.typing_hold(payload.visible_len())).await;
        if let Err(e) = session
            .socket
            .send_presence(&target, ChatPresence::Paused)
            .await
        {
            debug!("presence to {target} failed: {e}");
        }

        let (id, sent, fallback_used) = match session.socket.send(&target, &payload).await {
            Ok(id) => (id, payload, false),
            Err(e) if matches!(payload, OutboundPayload::CopyCode { .. }) => {
                warn!("copy-code message to {target} failed ({e}), falling back to text");
                let text = OutboundPayload::Text(payload.preview());
                let id = session.socket.send(&target, &text).await?;
                (id, text, true)
            }
            Err(e) => return Err(e),
        };
        info!(
            session = %session.session_id,
            "sent {} message {id} to {target}",
            sent.message_type().as_str()
        );

        self.record(session, &target, &id, &sent).await;
        Ok(SentMessage {
            id,
            jid: target,
            fallback_used,
        })
    }

    async fn check_recipient(&self, session: &ActiveSession, target: &str) -> Result<(), GatewayError> {
        let Some(phone) = jid::phone_of(target) else {
            return Ok(());
        };
        match session.socket.on_whatsapp(&phone).await {
            Ok(true) => Ok(()),
            Ok(false) if self.config.strict_recipient_check => {
                Err(GatewayError::RecipientUnverified(phone))
            }
            Ok(false) => {
                warn!("{phone} has no account according to the existence check, sending anyway");
                Ok(())
            }
            Err(e) => {
                warn!("existence check for {phone} failed: {e}");
                Ok(())
            }
        }
    }

    fn initial_delay(&self) -> Duration {
        let min = self.config.min_delay_ms;
        let max = self.config.max_delay_ms.max(min);
        let ms = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }

    fn typing_hold(&self, visible_len: usize) -> Duration {
        let ms = (visible_len as u64)
            .saturating_mul(self.config.typing_ms_per_char)
            .min(self.config.typing_cap_ms);
        Duration::from_millis(ms)
    }

    async fn record(&self, session: &ActiveSession, target: &str, id: &str, payload: &OutboundPayload) {
        let record = MessageRecord {
            company_id: session.company_id.clone(),
            session_id: session.session_id.clone(),
            remote_jid: target.to_string(),
            whatsapp_id: id.to_string(),
            from_me: true,
            participant: None,
            content: payload.preview(),
            message_type: payload.message_type(),
            media_url: media_url(payload),
            status: MessageStatus::Sent,
            structured: structured(payload),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.upsert_message(&record).await {
            warn!("outbound message {id} not recorded: {e}");
        }
    }
}

fn media_url(payload: &OutboundPayload) -> Option<String> {
    match payload {
        OutboundPayload::Image(m) | OutboundPayload::Video(m) | OutboundPayload::Document(m) => {
            Some(m.url.clone())
        }
        OutboundPayload::Audio { url, .. } | OutboundPayload::Sticker { url } => Some(url.clone()),
        _ => None,
    }
}

fn structured(payload: &OutboundPayload) -> Option<StructuredContent> {
    match payload {
        OutboundPayload::Poll {
            name,
            options,
            selectable_count,
        } => Some(StructuredContent::Poll {
            name: name.clone(),
            options: options.clone(),
            selectable_count: *selectable_count,
        }),
        OutboundPayload::Location {
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
        OutboundPayload::Contact {
            display_name,
            vcard,
        } => Some(StructuredContent::Contact {
            display_name: display_name.clone(),
            vcard: vcard.clone(),
        }),
        _ => None,
    }
}
