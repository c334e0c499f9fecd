//! `ProtocolSocket` over a running `whatsapp-rust` client.

use async_trait::async_trait;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use wacore_binary::jid::Jid;
use wagate_core::error::GatewayError;
use wagate_core::event::{ChatPresence, MediaKind, MediaRef};
use wagate_core::outbound::{OutboundMedia, OutboundPayload};
use waproto::whatsapp as wa;
use whatsapp_rust::client::Client;
use whatsapp_rust::download::MediaType;

use super::keystore::SessionKeyStore;
use crate::media::MediaStore;
use crate::socket::{OwnProfile, ProtocolSocket};

/// Retry delays for sends: 500ms, 1s, 2s.
const RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];

pub struct WhatsAppSocket {
    session_id: String,
    client: Arc<Client>,
    keys: Arc<SessionKeyStore>,
    media: Option<MediaStore>,
    closed: AtomicBool,
}

impl WhatsAppSocket {
    pub fn new(
        session_id: &str,
        client: Arc<Client>,
        keys: Arc<SessionKeyStore>,
        media: Option<MediaStore>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            client,
            keys,
            media,
            closed: AtomicBool::new(false),
        }
    }

    fn parse_jid(jid: &str) -> Result<Jid, GatewayError> {
        jid.parse()
            .map_err(|e| GatewayError::Protocol(format!("invalid whatsapp JID '{jid}': {e}")))
    }

    async fn retry_send(&self, jid: &Jid, msg: wa::Message) -> Result<String, GatewayError> {
        let mut last_err = None;

        for (attempt, delay_ms) in RETRY_DELAYS_MS.iter().enumerate() {
            match self.client.send_message(jid.clone(), msg.clone()).await {
                Ok(msg_id) => return Ok(msg_id),
                Err(e) => {
                    let attempt_num = attempt + 1;
                    if attempt_num < RETRY_DELAYS_MS.len() {
                        warn!(
                            session = %self.session_id,
                            "send attempt {attempt_num}/{} failed: {e}, retrying in {delay_ms}ms",
                            RETRY_DELAYS_MS.len()
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
                    } else {
                        error!(
                            session = %self.session_id,
                            "send attempt {attempt_num}/{} failed: {e}, giving up",
                            RETRY_DELAYS_MS.len()
                        );
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(GatewayError::Protocol(format!(
            "send failed after {} attempts: {}",
            RETRY_DELAYS_MS.len(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| GatewayError::Media("media storage is not configured".into()))?;
        media.fetch(url).await
    }

    async fn build_message(&self, payload: &OutboundPayload) -> Result<wa::Message, GatewayError> {
        // Fetch a remote file and upload it to the media servers.
        macro_rules! upload {
            ($url:expr, $media_type:expr) => {{
                let bytes = self.fetch($url).await?;
                self.client
                    .upload(bytes, $media_type)
                    .await
                    .map_err(|e| GatewayError::Media(format!("upload failed: {e}")))?
            }};
        }
        macro_rules! uploaded {
            ($ty:ident, $upload:expr, $mimetype:expr, { $($field:ident: $value:expr),* $(,)? }) => {
                wa::message::$ty {
                    mimetype: Some($mimetype),
                    url: Some($upload.url),
                    direct_path: Some($upload.direct_path),
                    media_key: Some($upload.media_key),
                    file_enc_sha256: Some($upload.file_enc_sha256),
                    file_sha256: Some($upload.file_sha256),
                    file_length: Some($upload.file_length),
                    $($field: $value,)*
                    ..Default::default()
                }
            };
        }
        fn mimetype(media: &OutboundMedia, fallback: &str) -> String {
            media.mimetype.clone().unwrap_or_else(|| fallback.to_string())
        }

        let msg = match payload {
            OutboundPayload::Text(text) => wa::Message {
                conversation: Some(text.clone()),
                ..Default::default()
            },
            OutboundPayload::Image(media) => {
                let upload = upload!(&media.url, MediaType::Image);
                wa::Message {
                    image_message: Some(Box::new(uploaded!(ImageMessage, upload, mimetype(media, "image/jpeg"), {
                        caption: media.caption.clone(),
                    }))),
                    ..Default::default()
                }
            }
            OutboundPayload::Video(media) => {
                let upload = upload!(&media.url, MediaType::Video);
                wa::Message {
                    video_message: Some(Box::new(uploaded!(VideoMessage, upload, mimetype(media, "video/mp4"), {
                        caption: media.caption.clone(),
                    }))),
                    ..Default::default()
                }
            }
            OutboundPayload::Audio { url, ptt } => {
                let upload = upload!(url, MediaType::Audio);
                let mime = if *ptt { "audio/ogg; codecs=opus" } else { "audio/mpeg" };
                wa::Message {
                    audio_message: Some(Box::new(uploaded!(AudioMessage, upload, mime.to_string(), {
                        ptt: Some(*ptt),
                    }))),
                    ..Default::default()
                }
            }
            OutboundPayload::Document(media) => {
                let upload = upload!(&media.url, MediaType::Document);
                wa::Message {
                    document_message: Some(Box::new(uploaded!(DocumentMessage, upload, mimetype(media, "application/octet-stream"), {
                        caption: media.caption.clone(),
                        file_name: media.file_name.clone(),
                    }))),
                    ..Default::default()
                }
            }
            OutboundPayload::Sticker { url } => {
                let upload = upload!(url, MediaType::Sticker);
                wa::Message {
                    sticker_message: Some(Box::new(uploaded!(StickerMessage, upload, "image/webp".to_string(), {}))),
                    ..Default::default()
                }
            }
            OutboundPayload::Poll {
                name,
                options,
                selectable_count,
            } => {
                // Votes are encrypted against this secret.
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                wa::Message {
                    poll_creation_message: Some(Box::new(wa::message::PollCreationMessage {
                        name: Some(name.clone()),
                        options: options
                            .iter()
                            .map(|o| wa::message::poll_creation_message::Option {
                                option_name: Some(o.clone()),
                                ..Default::default()
                            })
                            .collect(),
                        selectable_options_count: Some(*selectable_count),
                        ..Default::default()
                    })),
                    message_context_info: Some(wa::MessageContextInfo {
                        message_secret: Some(secret),
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            }
            OutboundPayload::Location {
                latitude,
                longitude,
                name,
                address,
            } => wa::Message {
                location_message: Some(Box::new(wa::message::LocationMessage {
                    degrees_latitude: Some(*latitude),
                    degrees_longitude: Some(*longitude),
                    name: name.clone(),
                    address: address.clone(),
                    ..Default::default()
                })),
                ..Default::default()
            },
            OutboundPayload::Contact {
                display_name,
                vcard,
            } => wa::Message {
                contact_message: Some(Box::new(wa::message::ContactMessage {
                    display_name: Some(display_name.clone()),
                    vcard: Some(vcard.clone()),
                    ..Default::default()
                })),
                ..Default::default()
            },
            OutboundPayload::CopyCode { .. } => {
                return Err(GatewayError::Protocol(
                    "interactive copy-code buttons are not supported by this client".into(),
                ))
            }
        };
        Ok(msg)
    }
}

macro_rules! encrypted_media {
    ($ty:ident, $media:expr) => {
        wa::message::$ty {
            mimetype: $media.mimetype.clone(),
            url: $media.url.clone(),
            direct_path: $media.direct_path.clone(),
            media_key: Some($media.media_key.clone()),
            file_sha256: Some($media.file_sha256.clone()),
            file_enc_sha256: Some($media.file_enc_sha256.clone()),
            file_length: Some($media.file_length),
            ..Default::default()
        }
    };
}

#[async_trait]
impl ProtocolSocket for WhatsAppSocket {
    async fn send(&self, jid: &str, payload: &OutboundPayload) -> Result<String, GatewayError> {
        let target = Self::parse_jid(jid)?;
        let msg = self.build_message(payload).await?;
        self.retry_send(&target, msg).await
    }

    async fn send_presence(&self, jid: &str, presence: ChatPresence) -> Result<(), GatewayError> {
        let target = Self::parse_jid(jid)?;
        let chatstate = self.client.chatstate();
        let result = match presence {
            ChatPresence::Composing => chatstate.send_composing(&target).await,
            ChatPresence::Recording => chatstate.send_recording(&target).await,
            ChatPresence::Paused => chatstate.send_paused(&target).await,
        };
        result.map_err(|e| GatewayError::Protocol(format!("presence update failed: {e}")))
    }

    async fn on_whatsapp(&self, phone: &str) -> Result<bool, GatewayError> {
        let results = self
            .client
            .contacts()
            .is_on_whatsapp(&[phone])
            .await
            .map_err(|e| GatewayError::Protocol(format!("existence check failed: {e}")))?;
        Ok(results.iter().any(|r| r.is_registered))
    }

    async fn profile_picture_url(&self, jid: &str) -> Result<Option<String>, GatewayError> {
        let target = Self::parse_jid(jid)?;
        let picture = self
            .client
            .contacts()
            .get_profile_picture(&target, false)
            .await
            .map_err(|e| GatewayError::Protocol(format!("profile picture lookup failed: {e}")))?;
        Ok(picture.map(|p| p.url))
    }

    async fn download_media(
        &self,
        kind: MediaKind,
        media: &MediaRef,
    ) -> Result<Vec<u8>, GatewayError> {
        let result = match kind {
            MediaKind::Image => self.client.download(&encrypted_media!(ImageMessage, media)).await,
            MediaKind::Video => self.client.download(&encrypted_media!(VideoMessage, media)).await,
            MediaKind::Audio => self.client.download(&encrypted_media!(AudioMessage, media)).await,
            MediaKind::Document => {
                self.client
                    .download(&encrypted_media!(DocumentMessage, media))
                    .await
            }
            MediaKind::Sticker => {
                self.client
                    .download(&encrypted_media!(StickerMessage, media))
                    .await
            }
        };
        result.map_err(|e| GatewayError::Media(format!("download failed: {e}")))
    }

    async fn own_profile(&self) -> Result<OwnProfile, GatewayError> {
        let identity = self.keys.device_identity();
        let picture_url = match identity.jid.as_deref() {
            Some(jid) => self.profile_picture_url(jid).await.unwrap_or_else(|e| {
                warn!(session = %self.session_id, "own picture lookup failed: {e}");
                None
            }),
            None => None,
        };
        Ok(OwnProfile {
            jid: identity.jid,
            name: identity.push_name,
            picture_url,
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.client.disconnect().await;
        info!(session = %self.session_id, "whatsapp client disconnected");
    }
}
