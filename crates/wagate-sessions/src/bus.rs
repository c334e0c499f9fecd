//! In-process notifications for realtime inbound messages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

pub type NotificationReceiver = broadcast::Receiver<Notification>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    NewMessageArrived {
        company_id: String,
        session_id: String,
        remote_jid: String,
        whatsapp_id: String,
        phone: Option<String>,
        push_name: Option<String>,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

/// Fan-out bus. Publishing never blocks; slow subscribers lag and drop.
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> NotificationReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}
