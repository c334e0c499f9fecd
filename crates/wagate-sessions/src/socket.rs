//! The seam between session management and the protocol library.
//!
//! A `SocketFactory` opens one connection per session and pushes every
//! library event into the session's channel as a `ProtocolEvent`. The
//! returned `ProtocolSocket` is the command surface used by handlers and the
//! outbound sender.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use wagate_core::error::GatewayError;
use wagate_core::event::{ChatPresence, MediaKind, MediaRef, ProtocolEvent};
use wagate_core::outbound::OutboundPayload;
use wagate_store::Store;

use crate::auth::AuthStateStore;

/// Identity of the linked account, fetched once connected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnProfile {
    pub jid: Option<String>,
    pub name: Option<String>,
    pub picture_url: Option<String>,
}

/// Command surface of one open connection.
#[async_trait]
pub trait ProtocolSocket: Send + Sync {
    /// Send a payload and return the protocol message id.
    async fn send(&self, jid: &str, payload: &OutboundPayload) -> Result<String, GatewayError>;

    async fn send_presence(&self, jid: &str, presence: ChatPresence) -> Result<(), GatewayError>;

    /// Whether a phone number (digits only) has an account.
    async fn on_whatsapp(&self, phone: &str) -> Result<bool, GatewayError>;

    async fn profile_picture_url(&self, jid: &str) -> Result<Option<String>, GatewayError>;

    async fn download_media(
        &self,
        kind: MediaKind,
        media: &MediaRef,
    ) -> Result<Vec<u8>, GatewayError>;

    async fn own_profile(&self) -> Result<OwnProfile, GatewayError>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&self);
}

/// What a factory needs to open a connection for one session.
#[derive(Clone)]
pub struct SocketContext {
    pub session_id: String,
    pub company_id: String,
    pub device_name: String,
    pub auth: AuthStateStore,
    pub store: Store,
}

/// Opens protocol connections.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn open(
        &self,
        ctx: SocketContext,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolSocket>, GatewayError>;
}

/// A live session as seen by handlers: who owns it and how to talk to it.
#[derive(Clone)]
pub struct ActiveSession {
    pub session_id: String,
    pub company_id: String,
    pub socket: Arc<dyn ProtocolSocket>,
    /// The linked account's own JID, once known.
    pub own_jid: Option<String>,
}

impl ActiveSession {
    pub fn own_phone(&self) -> Option<String> {
        self.own_jid
            .as_deref()
            .and_then(wagate_core::jid::phone_of)
    }
}
