//! # wagate-core
//!
//! Core types, configuration, identity helpers, and error handling for the
//! wagate session gateway.

pub mod config;
pub mod error;
pub mod event;
pub mod jid;
pub mod message;
pub mod outbound;

pub use config::shellexpand;
