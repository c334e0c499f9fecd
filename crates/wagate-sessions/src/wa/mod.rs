//! WhatsApp Web adapter built on `whatsapp-rust`.
//!
//! Each session runs its own bot. Key material lives in the shared
//! `auth_state` table through [`SessionKeyStore`], and library events are
//! translated into `ProtocolEvent`s on the session's channel.

mod convert;
mod keystore;
mod socket;

pub use convert::{content_of, history_chunk, map_event};
pub use keystore::{DeviceIdentity, SessionKeyStore};
pub use socket::WhatsAppSocket;

use async_trait::async_trait;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wagate_core::error::GatewayError;
use wagate_core::event::ProtocolEvent;
use whatsapp_rust::bot::Bot;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

use crate::media::MediaStore;
use crate::socket::{ProtocolSocket, SocketContext, SocketFactory};

/// Opens one `whatsapp-rust` bot per session.
#[derive(Clone, Default)]
pub struct WhatsAppFactory {
    media: Option<MediaStore>,
}

impl WhatsAppFactory {
    pub fn new(media: Option<MediaStore>) -> Self {
        Self { media }
    }
}

#[async_trait]
impl SocketFactory for WhatsAppFactory {
    async fn open(
        &self,
        ctx: SocketContext,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolSocket>, GatewayError> {
        let session_id = ctx.session_id.clone();
        info!(session = %session_id, "opening whatsapp connection");

        let keys = Arc::new(SessionKeyStore::new(
            &ctx.session_id,
            &ctx.company_id,
            ctx.auth.clone(),
            ctx.store.clone(),
            events.clone(),
        ));

        let history_seq = Arc::new(AtomicU32::new(0));
        let event_session = session_id.clone();
        let mut bot = Bot::builder()
            .with_backend(keys.clone())
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .with_device_props(
                Some(ctx.device_name.clone()),
                None,
                Some(waproto::whatsapp::device_props::PlatformType::Desktop),
            )
            .on_event(move |event, _client| {
                let events = events.clone();
                let history_seq = history_seq.clone();
                let session_id = event_session.clone();
                async move {
                    for mapped in map_event(event, &history_seq) {
                        if events.send(mapped).await.is_err() {
                            debug!(session = %session_id, "event receiver dropped");
                            return;
                        }
                    }
                }
            })
            .build()
            .await
            .map_err(|e| GatewayError::Protocol(format!("whatsapp bot build failed: {e}")))?;

        let client = bot.client();
        let _handle = bot
            .run()
            .await
            .map_err(|e| GatewayError::Protocol(format!("whatsapp bot run failed: {e}")))?;

        Ok(Arc::new(WhatsAppSocket::new(
            &session_id,
            client,
            keys,
            self.media.clone(),
        )))
    }
}
