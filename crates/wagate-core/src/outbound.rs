//! Outbound message specs and their validated payloads.
//!
//! `MessageSpec` is what callers hand to the sender (loosely filled,
//! deserialized from API requests or built by the scheduler). `validate()`
//! turns it into an `OutboundPayload` with every required field present.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::message::MessageType;

/// Caller-supplied outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageSpec {
    Text {
        text: Option<String>,
    },
    Image {
        url: Option<String>,
        caption: Option<String>,
    },
    Video {
        url: Option<String>,
        caption: Option<String>,
    },
    Audio {
        url: Option<String>,
        /// Push-to-talk voice note.
        #[serde(default)]
        ptt: bool,
    },
    Document {
        url: Option<String>,
        file_name: Option<String>,
        mimetype: Option<String>,
        caption: Option<String>,
    },
    Sticker {
        url: Option<String>,
    },
    Poll {
        name: Option<String>,
        #[serde(default)]
        options: Vec<String>,
        #[serde(rename = "selectableOptionsCount", alias = "selectable_count")]
        selectable_count: Option<u32>,
    },
    Location {
        latitude: Option<f64>,
        longitude: Option<f64>,
        name: Option<String>,
        address: Option<String>,
    },
    Contact {
        display_name: Option<String>,
        phone: Option<String>,
        vcard: Option<String>,
    },
    /// Interactive "copy code" button, used to share payment keys.
    CopyCode {
        text: Option<String>,
        code: Option<String>,
    },
}

/// Media reference for outbound media payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMedia {
    pub url: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
    pub mimetype: Option<String>,
}

/// A validated outbound payload. Closed set of variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutboundPayload {
    Text(String),
    Image(OutboundMedia),
    Video(OutboundMedia),
    Audio { url: String, ptt: bool },
    Document(OutboundMedia),
    Sticker { url: String },
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
    Contact { display_name: String, vcard: String },
    CopyCode { text: String, code: String },
}

fn required(value: &Option<String>, what: &str) -> Result<String, GatewayError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(GatewayError::InvalidPayload(format!("{what} is required"))),
    }
}

/// Minimal vCard 3.0 for a phone contact.
pub fn build_vcard(display_name: &str, phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    format!(
        "BEGIN:VCARD\nVERSION:3.0\nFN:{display_name}\nTEL;type=CELL;waid={digits}:+{digits}\nEND:VCARD"
    )
}

impl MessageSpec {
    /// Check required fields and resolve defaults.
    pub fn validate(&self) -> Result<OutboundPayload, GatewayError> {
        let media = |url: &Option<String>,
                     caption: &Option<String>,
                     file_name: &Option<String>,
                     mimetype: &Option<String>,
                     what: &str|
         -> Result<OutboundMedia, GatewayError> {
            Ok(OutboundMedia {
                url: required(url, &format!("{what} url"))?,
                caption: caption.clone().filter(|c| !c.is_empty()),
                file_name: file_name.clone(),
                mimetype: mimetype.clone(),
            })
        };

        match self {
            Self::Text { text } => Ok(OutboundPayload::Text(required(text, "text")?)),
            Self::Image { url, caption } => Ok(OutboundPayload::Image(media(
                url, caption, &None, &None, "image",
            )?)),
            Self::Video { url, caption } => Ok(OutboundPayload::Video(media(
                url, caption, &None, &None, "video",
            )?)),
            Self::Audio { url, ptt } => Ok(OutboundPayload::Audio {
                url: required(url, "audio url")?,
                ptt: *ptt,
            }),
            Self::Document {
                url,
                file_name,
                mimetype,
                caption,
            } => {
                let mut doc = media(url, caption, file_name, mimetype, "document")?;
                if doc.file_name.is_none() {
                    doc.file_name = doc.url.rsplit('/').next().map(str::to_string);
                }
                Ok(OutboundPayload::Document(doc))
            }
            Self::Sticker { url } => Ok(OutboundPayload::Sticker {
                url: required(url, "sticker url")?,
            }),
            Self::Poll {
                name,
                options,
                selectable_count,
            } => {
                let name = required(name, "poll name")?;
                let options: Vec<String> = options
                    .iter()
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect();
                if options.len() < 2 {
                    return Err(GatewayError::InvalidPayload(
                        "poll needs at least two options".into(),
                    ));
                }
                let count = selectable_count.unwrap_or(1);
                if count as usize > options.len() {
                    return Err(GatewayError::InvalidPayload(format!(
                        "selectable count {count} exceeds {} options",
                        options.len()
                    )));
                }
                Ok(OutboundPayload::Poll {
                    name,
                    options,
                    // 0 means "any number" on the wire; keep it.
                    selectable_count: count,
                })
            }
            Self::Location {
                latitude,
                longitude,
                name,
                address,
            } => match (latitude, longitude) {
                (Some(lat), Some(lng))
                    if (-90.0..=90.0).contains(lat) && (-180.0..=180.0).contains(lng) =>
                {
                    Ok(OutboundPayload::Location {
                        latitude: *lat,
                        longitude: *lng,
                        name: name.clone(),
                        address: address.clone(),
                    })
                }
                _ => Err(GatewayError::InvalidPayload(
                    "location needs valid latitude and longitude".into(),
                )),
            },
            Self::Contact {
                display_name,
                phone,
                vcard,
            } => {
                let display_name = required(display_name, "contact display name")?;
                let vcard = match (vcard.as_deref(), phone.as_deref()) {
                    (Some(v), _) if !v.trim().is_empty() => v.to_string(),
                    (_, Some(p)) if p.chars().any(|c| c.is_ascii_digit()) => {
                        build_vcard(&display_name, p)
                    }
                    _ => {
                        return Err(GatewayError::InvalidPayload(
                            "contact needs a vcard or a phone".into(),
                        ))
                    }
                };
                Ok(OutboundPayload::Contact {
                    display_name,
                    vcard,
                })
            }
            Self::CopyCode { text, code } => Ok(OutboundPayload::CopyCode {
                text: required(text, "copy code text")?,
                code: required(code, "copy code")?,
            }),
        }
    }
}

impl OutboundPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text(_) | Self::CopyCode { .. } => MessageType::Text,
            Self::Image(_) => MessageType::Image,
            Self::Video(_) => MessageType::Video,
            Self::Audio { .. } => MessageType::Audio,
            Self::Document(_) => MessageType::Document,
            Self::Sticker { .. } => MessageType::Sticker,
            Self::Poll { .. } => MessageType::Poll,
            Self::Location { .. } => MessageType::Location,
            Self::Contact { .. } => MessageType::Contact,
        }
    }

    /// Whether the humanized presence should be "recording" instead of "composing".
    pub fn is_voice(&self) -> bool {
        matches!(self, Self::Audio { .. })
    }

    /// Length of the human-visible text, used to size the typing hold.
    pub fn visible_len(&self) -> usize {
        match self {
            Self::Text(t) => t.chars().count(),
            Self::CopyCode { text, code } => text.chars().count() + code.chars().count(),
            Self::Image(m) | Self::Video(m) | Self::Document(m) => {
                m.caption.as_deref().map(|c| c.chars().count()).unwrap_or(0)
            }
            Self::Poll { name, options, .. } => {
                name.chars().count() + options.iter().map(|o| o.chars().count()).sum::<usize>()
            }
            Self::Location { .. } | Self::Contact { .. } | Self::Sticker { .. } => 0,
            Self::Audio { .. } => 0,
        }
    }

    /// Text shown in the stored record for this payload.
    pub fn preview(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::CopyCode { text, code } => format!("{text}\n\n{code}"),
            Self::Image(m) | Self::Video(m) | Self::Document(m) => {
                m.caption.clone().unwrap_or_else(|| m.url.clone())
            }
            Self::Audio { url, .. } | Self::Sticker { url } => url.clone(),
            Self::Poll { name, .. } => name.clone(),
            Self::Location { name, latitude, longitude, .. } => name
                .clone()
                .unwrap_or_else(|| format!("{latitude},{longitude}")),
            Self::Contact { display_name, .. } => display_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_defaults_selectable_count_to_one() {
        let spec: MessageSpec = serde_json::from_str(
            r#"{"type":"poll","name":"Pizza?","options":["Yes","No"]}"#,
        )
        .unwrap();
        match spec.validate().unwrap() {
            OutboundPayload::Poll {
                name,
                options,
                selectable_count,
            } => {
                assert_eq!(name, "Pizza?");
                assert_eq!(options, vec!["Yes", "No"]);
                assert_eq!(selectable_count, 1);
            }
            other => panic!("expected poll, got {other:?}"),
        }
    }

    #[test]
    fn test_poll_accepts_camel_case_count() {
        let spec: MessageSpec = serde_json::from_str(
            r#"{"type":"poll","name":"Toppings","options":["a","b","c"],"selectableOptionsCount":2}"#,
        )
        .unwrap();
        assert!(matches!(
            spec.validate().unwrap(),
            OutboundPayload::Poll { selectable_count: 2, .. }
        ));
    }

    #[test]
    fn test_missing_fields_are_invalid() {
        let cases = vec![
            MessageSpec::Text { text: None },
            MessageSpec::Text {
                text: Some("   ".into()),
            },
            MessageSpec::Image {
                url: None,
                caption: Some("hi".into()),
            },
            MessageSpec::Poll {
                name: Some("Q".into()),
                options: vec!["only".into()],
                selectable_count: None,
            },
            MessageSpec::Location {
                latitude: Some(120.0),
                longitude: Some(10.0),
                name: None,
                address: None,
            },
            MessageSpec::Contact {
                display_name: Some("Ana".into()),
                phone: None,
                vcard: None,
            },
            MessageSpec::CopyCode {
                text: Some("Pix".into()),
                code: None,
            },
        ];
        for spec in cases {
            assert!(
                matches!(spec.validate(), Err(GatewayError::InvalidPayload(_))),
                "expected invalid: {spec:?}"
            );
        }
    }

    #[test]
    fn test_contact_builds_vcard_from_phone() {
        let spec = MessageSpec::Contact {
            display_name: Some("Ana".into()),
            phone: Some("+55 11 98888-7777".into()),
            vcard: None,
        };
        match spec.validate().unwrap() {
            OutboundPayload::Contact { vcard, .. } => {
                assert!(vcard.contains("FN:Ana"));
                assert!(vcard.contains("waid=5511988887777"));
            }
            other => panic!("expected contact, got {other:?}"),
        }
    }

    #[test]
    fn test_document_file_name_from_url() {
        let spec = MessageSpec::Document {
            url: Some("https://cdn.example.com/files/boleto.pdf".into()),
            file_name: None,
            mimetype: None,
            caption: None,
        };
        match spec.validate().unwrap() {
            OutboundPayload::Document(m) => assert_eq!(m.file_name.as_deref(), Some("boleto.pdf")),
            other => panic!("expected document, got {other:?}"),
        }
    }

    #[test]
    fn test_voice_and_visible_len() {
        let audio = OutboundPayload::Audio {
            url: "https://x/a.ogg".into(),
            ptt: true,
        };
        assert!(audio.is_voice());
        assert_eq!(OutboundPayload::Text("héllo".into()).visible_len(), 5);
    }
}
