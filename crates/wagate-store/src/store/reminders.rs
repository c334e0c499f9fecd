//! Appointment reminders polled by the scheduler.

use super::{now_secs, Store};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use wagate_core::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub id: String,
    pub company_id: String,
    pub phone: String,
    pub contact_name: Option<String>,
    pub title: String,
    pub scheduled_for: DateTime<Utc>,
    /// Per-reminder template overriding the configured one.
    pub template: Option<String>,
}

impl Store {
    pub async fn create_reminder(
        &self,
        company_id: &str,
        phone: &str,
        contact_name: Option<&str>,
        title: &str,
        scheduled_for: DateTime<Utc>,
        template: Option<&str>,
    ) -> Result<String, GatewayError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO reminders (id, company_id, phone, contact_name, title, scheduled_for, template) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(company_id)
        .bind(phone)
        .bind(contact_name)
        .bind(title)
        .bind(scheduled_for.timestamp())
        .bind(template)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("create reminder failed: {e}")))?;
        Ok(id)
    }

    /// Unsent reminders scheduled between `now` and `until`, soonest first.
    pub async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Reminder>, GatewayError> {
        let rows: Vec<(String, String, String, Option<String>, String, i64, Option<String>)> =
            sqlx::query_as(
                "SELECT id, company_id, phone, contact_name, title, scheduled_for, template \
                 FROM reminders WHERE sent = 0 AND scheduled_for >= ? AND scheduled_for <= ? \
                 ORDER BY scheduled_for ASC",
            )
            .bind(now.timestamp())
            .bind(until.timestamp())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("due reminders failed: {e}")))?;

        Ok(rows
            .into_iter()
            .filter_map(
                |(id, company_id, phone, contact_name, title, ts, template)| {
                    Some(Reminder {
                        id,
                        company_id,
                        phone,
                        contact_name,
                        title,
                        scheduled_for: DateTime::from_timestamp(ts, 0)?,
                        template,
                    })
                },
            )
            .collect())
    }

    pub async fn mark_reminder_sent(&self, id: &str) -> Result<(), GatewayError> {
        sqlx::query("UPDATE reminders SET sent = 1, sent_at = ? WHERE id = ?")
            .bind(now_secs())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("mark reminder sent failed: {e}")))?;
        Ok(())
    }
}
