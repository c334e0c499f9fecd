//! # wagate-sessions
//!
//! Session lifecycle, inbound ingestion, history backfill, outbound sending
//! and reminder scheduling for wagate.

pub mod auth;
pub mod bus;
pub mod dispatcher;
pub mod handlers;
pub mod history;
pub mod ingest;
pub mod manager;
pub mod media;
pub mod qr;
pub mod queue;
pub mod reminders;
pub mod sender;
pub mod socket;
pub mod wa;
pub mod webhook;
pub mod whisper;

#[cfg(test)]
mod testing;

pub use manager::{SessionManager, SessionSignal, SessionState};
pub use sender::{OutboundSender, SentMessage};
pub use socket::{ActiveSession, ProtocolSocket, SocketFactory};
