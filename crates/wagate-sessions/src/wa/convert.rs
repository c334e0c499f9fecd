//! Translation from library events and protobuf messages into `ProtocolEvent`s.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use wacore::types::events::Event;
use wacore::types::message::MessageInfo;
use wacore::types::presence::{ChatPresence as WaChatPresence, ReceiptType};
use wagate_core::event::{
    CloseReason, ConnectionUpdate, HistoryChunk, MediaRef, MessageKey, PresenceKind,
    PresenceUpdate, ProtocolEvent, RawContact, RawContent, RawMessage, ReactionUpdate,
    ReceiptUpdate, UpsertKind,
};
use wagate_core::jid;
use wagate_core::message::MessageStatus;
use waproto::whatsapp as wa;

/// Close code the server sends when another client took over the session.
const CONNECTION_REPLACED: u16 = 440;

/// Map one library event. Most events yield zero or one `ProtocolEvent`;
/// a message can also carry a reaction or an identity mapping.
pub fn map_event(event: Event, history_seq: &AtomicU32) -> Vec<ProtocolEvent> {
    match event {
        Event::PairingQrCode { code, .. } => {
            vec![ProtocolEvent::Connection(ConnectionUpdate::Qr(code))]
        }
        Event::PairSuccess(_) => vec![ProtocolEvent::CredentialsRotated],
        Event::Connected(_) => vec![ProtocolEvent::Connection(ConnectionUpdate::Open)],
        Event::Disconnected(_) => vec![close(CloseReason::transient("disconnected"))],
        Event::LoggedOut(_) => vec![close(CloseReason::logged_out())],
        Event::StreamReplaced(_) => vec![close(CloseReason {
            code: Some(CONNECTION_REPLACED),
            logged_out: false,
            message: "connection replaced".into(),
        })],
        Event::ConnectFailure(_) => vec![close(CloseReason::transient("connect failure"))],
        Event::StreamError(_) => vec![close(CloseReason::transient("stream error"))],
        Event::Message(msg, info) => message_events(&msg, &info),
        Event::Receipt(receipt) => {
            let status = match receipt.r#type {
                ReceiptType::Delivered => MessageStatus::Delivered,
                ReceiptType::Read | ReceiptType::ReadSelf => MessageStatus::Read,
                _ => return Vec::new(),
            };
            vec![ProtocolEvent::Receipts(vec![ReceiptUpdate {
                remote_jid: jid::normalize(&receipt.source.chat.to_string()),
                message_ids: receipt.message_ids.iter().map(|id| id.to_string()).collect(),
                status,
                from_self: receipt.source.is_from_me,
            }])]
        }
        Event::Presence(presence) => vec![ProtocolEvent::Presence(PresenceUpdate {
            jid: jid::normalize(&presence.from.to_string()),
            kind: if presence.unavailable {
                PresenceKind::Unavailable
            } else {
                PresenceKind::Available
            },
            last_seen: presence.last_seen,
        })],
        Event::ChatPresence(chatstate) => {
            let kind = match chatstate.state {
                WaChatPresence::Composing => PresenceKind::Composing,
                _ => PresenceKind::Paused,
            };
            vec![ProtocolEvent::Presence(PresenceUpdate {
                jid: jid::normalize(&chatstate.source.sender.to_string()),
                kind,
                last_seen: None,
            })]
        }
        Event::PushNameUpdate(update) => {
            vec![ProtocolEvent::ContactsUpsert(vec![RawContact {
                id: jid::normalize(&update.jid.to_string()),
                notify: Some(update.message.push_name.clone()).filter(|n| !n.is_empty()),
                ..Default::default()
            }])]
        }
        Event::HistorySync(sync) => {
            let fallback = history_seq.fetch_add(1, Ordering::SeqCst);
            vec![ProtocolEvent::HistoryChunk(history_chunk(&sync, fallback))]
        }
        _ => Vec::new(),
    }
}

fn close(reason: CloseReason) -> ProtocolEvent {
    ProtocolEvent::Connection(ConnectionUpdate::Close(reason))
}

fn message_events(msg: &wa::Message, info: &MessageInfo) -> Vec<ProtocolEvent> {
    let chat = jid::normalize(&info.source.chat.to_string());
    let sender = jid::normalize(&info.source.sender.to_string());
    let sender_alt = info
        .source
        .sender_alt
        .as_ref()
        .map(|j| jid::normalize(&j.to_string()));

    let mut events = Vec::new();
    if let Some(alt) = sender_alt.as_deref() {
        if jid::is_lid(&sender) && jid::phone_of(alt).is_some() {
            events.push(ProtocolEvent::IdentityMapping {
                alias: sender.clone(),
                phone: alt.to_string(),
            });
        }
    }

    let key = MessageKey {
        remote_jid: chat.clone(),
        id: info.id.clone(),
        from_me: info.source.is_from_me,
        participant: info.source.is_group.then(|| sender.clone()),
        remote_jid_alt: conversation_alt(info.source.is_group, info.source.is_from_me, sender_alt),
    };

    if let Some(reaction) = reaction_of(msg, &key, &sender) {
        events.push(ProtocolEvent::Reactions(vec![reaction]));
    }

    events.push(ProtocolEvent::Messages {
        kind: UpsertKind::Notify,
        messages: vec![RawMessage {
            key,
            push_name: Some(info.push_name.clone()).filter(|n| !n.is_empty()),
            timestamp: info.timestamp,
            content: content_of(msg),
        }],
    });
    events
}

/// Phone form of a 1:1 chat. The sender's alt only names the chat when the
/// other party sent the message; on our own messages it is our number.
fn conversation_alt(is_group: bool, from_me: bool, sender_alt: Option<String>) -> Option<String> {
    if is_group || from_me {
        None
    } else {
        sender_alt
    }
}

fn reaction_of(msg: &wa::Message, key: &MessageKey, actor: &str) -> Option<ReactionUpdate> {
    let reaction = msg.reaction_message.as_ref()?;
    let target = reaction.key.as_ref()?;
    Some(ReactionUpdate {
        target: MessageKey {
            remote_jid: target
                .remote_jid
                .as_deref()
                .map(jid::normalize)
                .unwrap_or_else(|| key.remote_jid.clone()),
            id: target.id.clone().unwrap_or_default(),
            from_me: target.from_me.unwrap_or(false),
            participant: target.participant.as_deref().map(jid::normalize),
            remote_jid_alt: None,
        },
        actor: actor.to_string(),
        emoji: reaction.text.clone().unwrap_or_default(),
    })
}

macro_rules! media_ref {
    ($m:expr) => {
        MediaRef {
            mimetype: $m.mimetype.clone(),
            url: $m.url.clone(),
            direct_path: $m.direct_path.clone(),
            media_key: $m.media_key.clone().unwrap_or_default(),
            file_sha256: $m.file_sha256.clone().unwrap_or_default(),
            file_enc_sha256: $m.file_enc_sha256.clone().unwrap_or_default(),
            file_length: $m.file_length.unwrap_or(0),
        }
    };
}

fn wrapped(inner: Option<&wa::Message>) -> RawContent {
    inner.map(content_of).unwrap_or(RawContent::Unknown)
}

/// Convert a protobuf message tree into `RawContent`.
pub fn content_of(msg: &wa::Message) -> RawContent {
    if let Some(text) = msg.conversation.as_ref() {
        return RawContent::Text(text.clone());
    }
    if let Some(ext) = msg.extended_text_message.as_ref() {
        return RawContent::ExtendedText(ext.text.clone().unwrap_or_default());
    }
    if let Some(img) = msg.image_message.as_ref() {
        return RawContent::Image {
            caption: img.caption.clone(),
            media: media_ref!(img),
        };
    }
    if let Some(video) = msg.video_message.as_ref() {
        return RawContent::Video {
            caption: video.caption.clone(),
            media: media_ref!(video),
        };
    }
    if let Some(audio) = msg.audio_message.as_ref() {
        return RawContent::Audio {
            ptt: audio.ptt.unwrap_or(false),
            seconds: audio.seconds,
            media: media_ref!(audio),
        };
    }
    if let Some(doc) = msg.document_message.as_ref() {
        return RawContent::Document {
            caption: doc.caption.clone(),
            file_name: doc.file_name.clone(),
            media: media_ref!(doc),
        };
    }
    if let Some(sticker) = msg.sticker_message.as_ref() {
        return RawContent::Sticker {
            media: media_ref!(sticker),
        };
    }
    if let Some(loc) = msg.location_message.as_ref() {
        return RawContent::Location {
            latitude: loc.degrees_latitude.unwrap_or(0.0),
            longitude: loc.degrees_longitude.unwrap_or(0.0),
            name: loc.name.clone(),
            address: loc.address.clone(),
        };
    }
    if let Some(contact) = msg.contact_message.as_ref() {
        return RawContent::ContactCard {
            display_name: contact.display_name.clone().unwrap_or_default(),
            vcard: contact.vcard.clone().unwrap_or_default(),
        };
    }
    let poll = msg
        .poll_creation_message
        .as_ref()
        .or(msg.poll_creation_message_v2.as_ref())
        .or(msg.poll_creation_message_v3.as_ref());
    if let Some(poll) = poll {
        return RawContent::PollCreation {
            name: poll.name.clone().unwrap_or_default(),
            options: poll
                .options
                .iter()
                .filter_map(|o| o.option_name.clone())
                .collect(),
            selectable_count: poll.selectable_options_count.unwrap_or(0),
        };
    }

    if let Some(sent) = msg.device_sent_message.as_ref() {
        return wrapped(sent.message.as_deref());
    }
    if let Some(eph) = msg.ephemeral_message.as_ref() {
        return RawContent::Ephemeral(Box::new(wrapped(eph.message.as_deref())));
    }
    let view_once = msg
        .view_once_message
        .as_ref()
        .or(msg.view_once_message_v2.as_ref());
    if let Some(vo) = view_once {
        return RawContent::ViewOnce(Box::new(wrapped(vo.message.as_deref())));
    }
    if let Some(dwc) = msg.document_with_caption_message.as_ref() {
        return RawContent::DocumentWithCaption(Box::new(wrapped(dwc.message.as_deref())));
    }

    if msg.protocol_message.is_some() {
        return RawContent::Protocol;
    }
    if msg.reaction_message.is_some() {
        return RawContent::Reaction;
    }
    if msg.poll_update_message.is_some() {
        return RawContent::PollUpdate;
    }
    if msg.sender_key_distribution_message.is_some() {
        return RawContent::SenderKeyDistribution;
    }
    if msg.message_context_info.is_some() {
        return RawContent::ContextInfoOnly;
    }
    RawContent::Unknown
}

fn timestamp(secs: Option<u64>) -> DateTime<Utc> {
    secs.and_then(|s| Utc.timestamp_opt(s as i64, 0).single())
        .unwrap_or_else(Utc::now)
}

/// One stored history message. `None` when it has no id or payload.
fn history_message(info: &wa::WebMessageInfo) -> Option<RawMessage> {
    let key = &info.key;
    let id = key.id.clone()?;
    let remote_jid = jid::normalize(key.remote_jid.as_deref()?);
    let content = content_of(info.message.as_ref()?);
    Some(RawMessage {
        key: MessageKey {
            remote_jid,
            id,
            from_me: key.from_me.unwrap_or(false),
            participant: key
                .participant
                .as_deref()
                .or(info.participant.as_deref())
                .map(jid::normalize),
            remote_jid_alt: None,
        },
        push_name: info.push_name.clone().filter(|n| !n.is_empty()),
        timestamp: timestamp(info.message_timestamp),
        content,
    })
}

/// Convert a history sync blob. `fallback_seq` numbers chunks that carry no
/// order of their own.
pub fn history_chunk(sync: &wa::HistorySync, fallback_seq: u32) -> HistoryChunk {
    let mut contacts = Vec::new();
    let mut messages = Vec::new();

    for conversation in &sync.conversations {
        let id = jid::normalize(&conversation.id);
        if let Some(name) = conversation.name.clone().filter(|n| !n.trim().is_empty()) {
            if !jid::is_group(&id) {
                contacts.push(RawContact {
                    id: id.clone(),
                    name: Some(name),
                    ..Default::default()
                });
            }
        }
        messages.extend(
            conversation
                .messages
                .iter()
                .filter_map(|m| m.message.as_ref())
                .filter_map(history_message),
        );
    }

    for pushname in &sync.pushnames {
        let (Some(id), Some(name)) = (pushname.id.as_deref(), pushname.pushname.as_ref()) else {
            continue;
        };
        contacts.push(RawContact {
            id: jid::normalize(id),
            notify: Some(name.clone()),
            ..Default::default()
        });
    }

    let progress = sync.progress.map(|p| p.min(100) as u8);
    HistoryChunk {
        sequence: sync.chunk_order.unwrap_or(fallback_seq),
        contacts,
        messages,
        is_latest: progress.is_some_and(|p| p >= 100),
        progress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wagate_core::message::MessageType;

    fn text(body: &str) -> wa::Message {
        wa::Message {
            conversation: Some(body.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_own_messages_do_not_name_the_chat() {
        let own = Some("5511000000000@s.whatsapp.net".to_string());
        assert_eq!(conversation_alt(false, true, own.clone()), None);
        assert_eq!(conversation_alt(true, false, own.clone()), None);
        assert_eq!(conversation_alt(false, false, own.clone()), own);
    }

    #[test]
    fn test_plain_and_extended_text() {
        assert!(matches!(content_of(&text("oi")), RawContent::Text(t) if t == "oi"));

        let ext = wa::Message {
            extended_text_message: Some(Box::new(wa::message::ExtendedTextMessage {
                text: Some("link".into()),
                ..Default::default()
            })),
            ..Default::default()
        };
        assert_eq!(content_of(&ext).text(), "link");
    }

    #[test]
    fn test_ephemeral_wrapper_is_kept_and_unwrappable() {
        let msg = wa::Message {
            ephemeral_message: Some(Box::new(wa::message::FutureProofMessage {
                message: Some(Box::new(text("sumindo"))),
            })),
            ..Default::default()
        };
        let content = content_of(&msg);
        assert!(matches!(content, RawContent::Ephemeral(_)));
        assert_eq!(content.message_type(), MessageType::Text);
        assert_eq!(content.text(), "sumindo");
    }

    #[test]
    fn test_audio_carries_media_ref() {
        let msg = wa::Message {
            audio_message: Some(Box::new(wa::message::AudioMessage {
                ptt: Some(true),
                mimetype: Some("audio/ogg; codecs=opus".into()),
                direct_path: Some("/v/t62/abc".into()),
                media_key: Some(vec![1; 32]),
                file_length: Some(1234),
                ..Default::default()
            })),
            ..Default::default()
        };
        match content_of(&msg) {
            RawContent::Audio { ptt, media, .. } => {
                assert!(ptt);
                assert_eq!(media.direct_path.as_deref(), Some("/v/t62/abc"));
                assert_eq!(media.file_length, 1234);
            }
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[test]
    fn test_control_messages_are_protocol_only() {
        let msg = wa::Message {
            protocol_message: Some(Box::new(wa::message::ProtocolMessage::default())),
            ..Default::default()
        };
        assert!(content_of(&msg).is_protocol_only());
        assert!(matches!(content_of(&wa::Message::default()), RawContent::Unknown));
    }

    #[test]
    fn test_content_wins_over_sender_key_distribution() {
        let msg = wa::Message {
            sender_key_distribution_message: Some(
                wa::message::SenderKeyDistributionMessage::default(),
            ),
            ..text("primeira no grupo")
        };
        assert!(!content_of(&msg).is_protocol_only());
    }

    #[test]
    fn test_history_chunk_collects_contacts_and_messages() {
        let sync = wa::HistorySync {
            conversations: vec![wa::Conversation {
                id: "5511999999999@s.whatsapp.net".into(),
                name: Some("Maria".into()),
                messages: vec![wa::HistorySyncMsg {
                    message: Some(wa::WebMessageInfo {
                        key: wa::MessageKey {
                            remote_jid: Some("5511999999999@s.whatsapp.net".into()),
                            from_me: Some(false),
                            id: Some("ABC".into()),
                            participant: None,
                        },
                        message: Some(text("oi")),
                        message_timestamp: Some(1_700_000_000),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            pushnames: vec![wa::Pushname {
                id: Some("5511888888888@s.whatsapp.net".into()),
                pushname: Some("Jo".into()),
            }],
            progress: Some(100),
            chunk_order: Some(4),
            ..Default::default()
        };

        let chunk = history_chunk(&sync, 0);
        assert_eq!(chunk.sequence, 4);
        assert!(chunk.is_latest);
        assert_eq!(chunk.contacts.len(), 2);
        assert_eq!(chunk.messages.len(), 1);
        assert_eq!(chunk.messages[0].key.id, "ABC");
        assert_eq!(chunk.messages[0].timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_history_chunk_without_progress_is_not_latest() {
        let chunk = history_chunk(&wa::HistorySync::default(), 7);
        assert_eq!(chunk.sequence, 7);
        assert!(!chunk.is_latest);
        assert!(chunk.progress.is_none());
    }
}
