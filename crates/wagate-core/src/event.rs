//! Protocol events as a closed tagged union.
//!
//! The protocol adapter translates whatever its library emits into these
//! variants; the per-session dispatcher matches on them exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{MessageStatus, MessageType};

/// Everything a session can receive from the protocol layer.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Connection(ConnectionUpdate),
    /// Key material or root credentials were rewritten by the library.
    CredentialsRotated,
    Messages {
        kind: UpsertKind,
        messages: Vec<RawMessage>,
    },
    ContactsUpsert(Vec<RawContact>),
    Presence(PresenceUpdate),
    Receipts(Vec<ReceiptUpdate>),
    Reactions(Vec<ReactionUpdate>),
    PollVotes(Vec<PollVoteUpdate>),
    HistoryChunk(HistoryChunk),
    /// The library learned both forms of one identity.
    IdentityMapping { alias: String, phone: String },
}

/// Connection state change.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionUpdate {
    /// A new scan payload is available for pairing.
    Qr(String),
    Open,
    Close(CloseReason),
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloseReason {
    /// Status code reported by the server, when any.
    pub code: Option<u16>,
    /// The account explicitly unlinked this device.
    pub logged_out: bool,
    pub message: String,
}

impl CloseReason {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            code: None,
            logged_out: false,
            message: message.into(),
        }
    }

    pub fn logged_out() -> Self {
        Self {
            code: Some(401),
            logged_out: true,
            message: "logged out".into(),
        }
    }

    /// Fatal closes tear the session down for good and wipe its credentials.
    pub fn is_fatal(&self, fatal_codes: &[u16]) -> bool {
        self.logged_out || self.code.is_some_and(|c| fatal_codes.contains(&c))
    }
}

/// Fresh traffic vs. messages appended while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Notify,
    Append,
}

/// Identifies one protocol message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageKey {
    pub remote_jid: String,
    pub id: String,
    pub from_me: bool,
    /// Sender inside a group.
    pub participant: Option<String>,
    /// Phone-number form of `remote_jid` when the library knows it.
    pub remote_jid_alt: Option<String>,
}

/// One message as delivered by the protocol layer.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub key: MessageKey,
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub content: RawContent,
}

/// Kinds of downloadable media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
            Self::Audio => "ogg",
            Self::Document => "bin",
            Self::Sticker => "webp",
        }
    }
}

/// Everything needed to fetch and decrypt one media attachment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaRef {
    pub mimetype: Option<String>,
    pub url: Option<String>,
    pub direct_path: Option<String>,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
}

impl MediaRef {
    /// File extension from the mimetype, falling back to the kind's default.
    pub fn extension(&self, kind: MediaKind) -> String {
        self.mimetype
            .as_deref()
            .and_then(|m| m.split('/').nth(1))
            .map(|ext| ext.split(';').next().unwrap_or(ext).trim().to_string())
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| kind.default_extension().to_string())
    }
}

/// Protocol message payload tree.
#[derive(Debug, Clone)]
pub enum RawContent {
    Text(String),
    ExtendedText(String),
    Image {
        caption: Option<String>,
        media: MediaRef,
    },
    Video {
        caption: Option<String>,
        media: MediaRef,
    },
    Audio {
        ptt: bool,
        seconds: Option<u32>,
        media: MediaRef,
    },
    Document {
        caption: Option<String>,
        file_name: Option<String>,
        media: MediaRef,
    },
    Sticker {
        media: MediaRef,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    ContactCard {
        display_name: String,
        vcard: String,
    },
    PollCreation {
        name: String,
        options: Vec<String>,
        selectable_count: u32,
    },
    Ephemeral(Box<RawContent>),
    ViewOnce(Box<RawContent>),
    DocumentWithCaption(Box<RawContent>),
    /// Revokes, edits, history notifications and other control messages.
    Protocol,
    SenderKeyDistribution,
    Reaction,
    PollUpdate,
    /// Carries only context info (mentions, quoted refs) and no content.
    ContextInfoOnly,
    Unknown,
}

impl RawContent {
    /// Strip ephemeral, view-once and caption wrappers.
    pub fn unwrap_envelope(&self) -> &RawContent {
        let mut current = self;
        loop {
            match current {
                Self::Ephemeral(inner) | Self::ViewOnce(inner) | Self::DocumentWithCaption(inner) => {
                    current = inner.as_ref();
                }
                other => return other,
            }
        }
    }

    /// Control messages that are never stored.
    pub fn is_protocol_only(&self) -> bool {
        matches!(
            self.unwrap_envelope(),
            Self::Protocol
                | Self::SenderKeyDistribution
                | Self::Reaction
                | Self::PollUpdate
                | Self::ContextInfoOnly
        )
    }

    pub fn message_type(&self) -> MessageType {
        match self.unwrap_envelope() {
            Self::Text(_) | Self::ExtendedText(_) => MessageType::Text,
            Self::Image { .. } => MessageType::Image,
            Self::Video { .. } => MessageType::Video,
            Self::Audio { .. } => MessageType::Audio,
            Self::Document { .. } => MessageType::Document,
            Self::Sticker { .. } => MessageType::Sticker,
            Self::Location { .. } => MessageType::Location,
            Self::ContactCard { .. } => MessageType::Contact,
            Self::PollCreation { .. } => MessageType::Poll,
            _ => MessageType::Unknown,
        }
    }

    /// Downloadable media carried by this message.
    pub fn media(&self) -> Option<(MediaKind, &MediaRef)> {
        match self.unwrap_envelope() {
            Self::Image { media, .. } => Some((MediaKind::Image, media)),
            Self::Video { media, .. } => Some((MediaKind::Video, media)),
            Self::Audio { media, .. } => Some((MediaKind::Audio, media)),
            Self::Document { media, .. } => Some((MediaKind::Document, media)),
            Self::Sticker { media } => Some((MediaKind::Sticker, media)),
            _ => None,
        }
    }

    /// Human-readable text: the body, a caption, or a placeholder.
    pub fn text(&self) -> String {
        match self.unwrap_envelope() {
            Self::Text(t) | Self::ExtendedText(t) => t.clone(),
            Self::Image { caption, .. } => caption.clone().unwrap_or_else(|| "[Imagem]".into()),
            Self::Video { caption, .. } => caption.clone().unwrap_or_else(|| "[Vídeo]".into()),
            Self::Audio { ptt: true, .. } => "[Mensagem de voz]".into(),
            Self::Audio { .. } => "[Áudio]".into(),
            Self::Document {
                caption, file_name, ..
            } => caption
                .clone()
                .or_else(|| file_name.clone())
                .unwrap_or_else(|| "[Documento]".into()),
            Self::Sticker { .. } => "[Figurinha]".into(),
            Self::Location { name, .. } => name.clone().unwrap_or_else(|| "[Localização]".into()),
            Self::ContactCard { display_name, .. } => display_name.clone(),
            Self::PollCreation { name, .. } => name.clone(),
            _ => String::new(),
        }
    }
}

/// One contact as supplied by contact sync or history backfill.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawContact {
    pub id: String,
    /// Alias form, when the library supplies both.
    pub lid: Option<String>,
    /// Address-book name.
    pub name: Option<String>,
    /// Self-chosen push name.
    pub notify: Option<String>,
    pub verified_name: Option<String>,
    pub img_url: Option<String>,
}

/// Presence kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Available,
    Unavailable,
    Composing,
    Recording,
    Paused,
}

impl PresenceKind {
    /// Composing/recording imply the contact is online.
    pub fn is_online(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub jid: String,
    pub kind: PresenceKind,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptUpdate {
    pub remote_jid: String,
    pub message_ids: Vec<String>,
    pub status: MessageStatus,
    /// Emitted by one of our own devices (our own read marker echoing back).
    pub from_self: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionUpdate {
    pub target: MessageKey,
    pub actor: String,
    /// Empty string removes the actor's reaction.
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollVoteUpdate {
    pub target: MessageKey,
    pub voter: String,
    pub options: Vec<String>,
}

/// One chunk of historical sync.
#[derive(Debug, Clone)]
pub struct HistoryChunk {
    /// Monotonic per-session chunk number used for dedup.
    pub sequence: u32,
    pub contacts: Vec<RawContact>,
    pub messages: Vec<RawMessage>,
    pub is_latest: bool,
    pub progress: Option<u8>,
}

/// Transient presence signal used while humanizing outbound sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPresence {
    Composing,
    Recording,
    Paused,
}
