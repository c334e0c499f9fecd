//! Canonical message records stored by the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
    Poll,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::Poll => "poll",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document | Self::Sticker
        )
    }
}

/// Delivery status. Ordered: a message only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Played,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Played => "played",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "played" => Some(Self::Played),
            _ => None,
        }
    }

    /// Numeric rank used by SQL-side monotonic updates.
    pub fn rank(&self) -> i64 {
        *self as i64
    }

    /// The later of two statuses.
    pub fn advance(self, next: Self) -> Self {
        self.max(next)
    }
}

/// Structured payload for message kinds that are more than text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StructuredContent {
    Poll {
        name: String,
        options: Vec<String>,
        selectable_count: u32,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Contact {
        display_name: String,
        vcard: String,
    },
}

/// One actor's reaction to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub actor: String,
    pub emoji: String,
}

/// Apply a reaction event: an actor has at most one reaction, a new one
/// replaces the old, and an empty emoji removes it.
pub fn apply_reaction(reactions: &mut Vec<Reaction>, actor: &str, emoji: &str) {
    reactions.retain(|r| r.actor != actor);
    if !emoji.is_empty() {
        reactions.push(Reaction {
            actor: actor.to_string(),
            emoji: emoji.to_string(),
        });
    }
}

/// One voter's current selection on a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollVote {
    pub voter: String,
    pub options: Vec<String>,
}

/// Last write wins per voter. An empty selection withdraws the vote.
pub fn apply_poll_vote(votes: &mut Vec<PollVote>, voter: &str, options: &[String]) {
    votes.retain(|v| v.voter != voter);
    if !options.is_empty() {
        votes.push(PollVote {
            voter: voter.to_string(),
            options: options.to_vec(),
        });
    }
}

/// Canonical representation of one protocol message.
///
/// Unique per `(company_id, remote_jid, whatsapp_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub company_id: String,
    pub session_id: String,
    pub remote_jid: String,
    pub whatsapp_id: String,
    pub from_me: bool,
    /// Sender inside a group conversation.
    pub participant: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub status: MessageStatus,
    pub structured: Option<StructuredContent>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_advance_never_regresses() {
        assert_eq!(
            MessageStatus::Read.advance(MessageStatus::Delivered),
            MessageStatus::Read
        );
        assert_eq!(
            MessageStatus::Sent.advance(MessageStatus::Delivered),
            MessageStatus::Delivered
        );
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
    }

    #[test]
    fn test_status_parse_round() {
        for s in ["pending", "sent", "delivered", "read", "played"] {
            assert_eq!(MessageStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(MessageStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_reaction_replace_and_remove() {
        let mut list = Vec::new();
        apply_reaction(&mut list, "a@s.whatsapp.net", "👍");
        apply_reaction(&mut list, "b@s.whatsapp.net", "❤️");
        apply_reaction(&mut list, "a@s.whatsapp.net", "😂");
        assert_eq!(list.len(), 2);
        assert!(list
            .iter()
            .any(|r| r.actor == "a@s.whatsapp.net" && r.emoji == "😂"));

        apply_reaction(&mut list, "b@s.whatsapp.net", "");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].actor, "a@s.whatsapp.net");
    }

    #[test]
    fn test_poll_vote_last_write_wins() {
        let mut votes = Vec::new();
        apply_poll_vote(&mut votes, "v1", &["Yes".to_string()]);
        apply_poll_vote(&mut votes, "v2", &["No".to_string()]);
        apply_poll_vote(&mut votes, "v1", &["No".to_string()]);
        assert_eq!(votes.len(), 2);
        let v1 = votes.iter().find(|v| v.voter == "v1").unwrap();
        assert_eq!(v1.options, vec!["No".to_string()]);

        apply_poll_vote(&mut votes, "v2", &[]);
        assert_eq!(votes.len(), 1);
    }

    #[test]
    fn test_structured_content_json_shape() {
        let poll = StructuredContent::Poll {
            name: "Pizza?".into(),
            options: vec!["Yes".into(), "No".into()],
            selectable_count: 1,
        };
        let json = serde_json::to_value(&poll).unwrap();
        assert_eq!(json["kind"], "poll");
        assert_eq!(json["selectable_count"], 1);
    }
}
