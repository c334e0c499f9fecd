//! Reminder scheduler: sends templated appointment reminders through each
//! tenant's connected session.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use wagate_core::config::SchedulerConfig;
use wagate_core::outbound::OutboundPayload;
use wagate_store::{Reminder, Store};

use crate::manager::SessionManager;
use crate::sender::OutboundSender;
use crate::socket::ActiveSession;

pub struct ReminderScheduler {
    store: Store,
    manager: SessionManager,
    sender: OutboundSender,
    config: SchedulerConfig,
}

impl ReminderScheduler {
    pub fn new(
        store: Store,
        manager: SessionManager,
        sender: OutboundSender,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            manager,
            sender,
            config,
        }
    }

    /// Poll forever. Callers abort the task to stop it.
    pub async fn run(self) {
        info!(
            "reminder scheduler started (every {}s, {}h ahead)",
            self.config.poll_interval_secs, self.config.lookahead_hours
        );
        loop {
            tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
            self.run_cycle(Utc::now()).await;
        }
    }

    /// One sweep. Returns how many reminders were sent.
    ///
    /// A reminder is marked sent only after its message went out, so a crash
    /// in between sends it again on the next run.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> usize {
        let until = now + ChronoDuration::hours(self.config.lookahead_hours);
        let due = match self.store.due_reminders(now, until).await {
            Ok(due) => due,
            Err(e) => {
                error!("scheduler: failed to load due reminders: {e}");
                return 0;
            }
        };
        if due.is_empty() {
            return 0;
        }

        let mut sessions: HashMap<String, Option<ActiveSession>> = HashMap::new();
        let mut sent = 0;
        for reminder in &due {
            if !sessions.contains_key(&reminder.company_id) {
                let session = self.manager.tenant_session(&reminder.company_id).await;
                sessions.insert(reminder.company_id.clone(), session);
            }
            let Some(session) = sessions.get(&reminder.company_id).and_then(Option::as_ref) else {
                debug!(
                    "scheduler: no connected session for {}, reminder {} waits",
                    reminder.company_id, reminder.id
                );
                continue;
            };

            let template = reminder
                .template
                .as_deref()
                .unwrap_or(&self.config.template);
            let text = render_template(template, reminder);
            match self
                .sender
                .send_payload(session, &reminder.phone, OutboundPayload::Text(text))
                .await
            {
                Ok(_) => {
                    if let Err(e) = self.store.mark_reminder_sent(&reminder.id).await {
                        warn!("scheduler: reminder {} sent but not marked: {e}", reminder.id);
                    }
                    sent += 1;
                }
                Err(e) => warn!(
                    "scheduler: reminder {} to {} failed: {e}",
                    reminder.id, reminder.phone
                ),
            }
        }
        if sent > 0 {
            info!("scheduler: sent {sent}/{} reminders", due.len());
        }
        sent
    }
}

/// Fill `{name}`, `{title}`, `{date}` (dd/mm/yyyy) and `{time}` (HH:MM, UTC).
pub fn render_template(template: &str, reminder: &Reminder) -> String {
    let name = reminder
        .contact_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("cliente");
    template
        .replace("{name}", name)
        .replace("{title}", &reminder.title)
        .replace("{date}", &reminder.scheduled_for.format("%d/%m/%Y").to_string())
        .replace("{time}", &reminder.scheduled_for.format("%H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_router, test_store, FakeFactory, FakeSocket};
    use chrono::TimeZone;
    use std::sync::Arc;
    use wagate_core::config::{SenderConfig, SessionConfig};
    use wagate_core::event::{ConnectionUpdate, ProtocolEvent};

    async fn scheduler() -> (ReminderScheduler, SessionManager, Arc<FakeFactory>, Store) {
        let store = test_store().await;
        let factory = Arc::new(FakeFactory::with_socket(FakeSocket::default()));
        let manager = SessionManager::new(
            SessionConfig::default(),
            std::env::temp_dir().join("__wagate_scheduler_tests"),
            store.clone(),
            factory.clone(),
            test_router(&store),
        );
        let sender = OutboundSender::new(
            manager.clone(),
            store.clone(),
            SenderConfig {
                min_delay_ms: 0,
                max_delay_ms: 0,
                typing_ms_per_char: 0,
                ..Default::default()
            },
        );
        let scheduler = ReminderScheduler::new(
            store.clone(),
            manager.clone(),
            sender,
            SchedulerConfig::default(),
        );
        (scheduler, manager, factory, store)
    }

    async fn connect(manager: &SessionManager, factory: &FakeFactory) {
        manager.start("s1", "t1").await.unwrap();
        factory
            .emit("s1", ProtocolEvent::Connection(ConnectionUpdate::Open))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
    }

    #[test]
    fn test_render_template() {
        let reminder = Reminder {
            id: "r1".into(),
            company_id: "t1".into(),
            phone: "5511999999999".into(),
            contact_name: Some("Maria".into()),
            title: "Consulta".into(),
            scheduled_for: Utc.with_ymd_and_hms(2026, 3, 9, 14, 30, 0).unwrap(),
            template: None,
        };
        let text = render_template(&SchedulerConfig::default().template, &reminder);
        assert_eq!(text, "Olá Maria! Lembrete: Consulta em 09/03/2026 às 14:30.");

        let anonymous = Reminder {
            contact_name: None,
            ..reminder
        };
        assert!(render_template("{name}", &anonymous).contains("cliente"));
    }

    #[tokio::test]
    async fn test_cycle_sends_once_and_marks() {
        let (scheduler, manager, factory, store) = scheduler().await;
        connect(&manager, &factory).await;
        let now = Utc::now();
        store
            .create_reminder(
                "t1",
                "5511999999999",
                Some("Maria"),
                "Consulta",
                now + ChronoDuration::hours(3),
                None,
            )
            .await
            .unwrap();
        store
            .create_reminder(
                "t1",
                "5511988887777",
                None,
                "Retorno",
                now + ChronoDuration::hours(48),
                None,
            )
            .await
            .unwrap();

        assert_eq!(scheduler.run_cycle(now).await, 1);
        assert_eq!(scheduler.run_cycle(now).await, 0);

        let sent = factory.socket.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "5511999999999@s.whatsapp.net");
        match &sent[0].1 {
            OutboundPayload::Text(t) => assert!(t.contains("Maria") && t.contains("Consulta")),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tenant_without_session_is_skipped_unmarked() {
        let (scheduler, manager, factory, store) = scheduler().await;
        let now = Utc::now();
        store
            .create_reminder(
                "t1",
                "5511999999999",
                Some("Ana"),
                "Consulta",
                now + ChronoDuration::hours(1),
                Some("Oi {name}"),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.run_cycle(now).await, 0);
        assert!(factory.socket.sent().is_empty());

        // Still due once the tenant connects.
        connect(&manager, &factory).await;
        assert_eq!(scheduler.run_cycle(now).await, 1);
        assert_eq!(
            factory.socket.sent()[0].1,
            OutboundPayload::Text("Oi Ana".into())
        );
    }

    #[tokio::test]
    async fn test_failed_send_stays_due() {
        let (scheduler, manager, factory, store) = scheduler().await;
        connect(&manager, &factory).await;
        factory
            .socket
            .fail_sends
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let now = Utc::now();
        store
            .create_reminder(
                "t1",
                "5511999999999",
                None,
                "Consulta",
                now + ChronoDuration::hours(1),
                None,
            )
            .await
            .unwrap();

        assert_eq!(scheduler.run_cycle(now).await, 0);
        factory
            .socket
            .fail_sends
            .store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(scheduler.run_cycle(now).await, 1);
    }
}
