//! # wagate-store
//!
//! SQLite persistence for sessions, credentials, contacts, leads, messages,
//! identity mappings, reminders and tenant webhooks.

pub mod store;

pub use store::{
    AuthRow, Contact, ContactPatch, Instance, Lead, NameSource, Reminder, Store, StoredMessage,
    CREDS_TYPE, STATUS_CONNECTED, STATUS_CONNECTING, STATUS_DISCONNECTED, STATUS_LOGGED_OUT,
    STATUS_QR_READY,
};
