//! Leads: one per (tenant, phone), created on first genuine inbound contact.

use super::Store;
use uuid::Uuid;
use wagate_core::error::GatewayError;
use wagate_core::jid::is_meaningful_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lead {
    pub id: String,
    pub company_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub status: String,
    pub pipeline_stage_id: Option<String>,
}

impl Store {
    /// Ensure a lead exists for `(company_id, phone)` and return it.
    ///
    /// Concurrent callers race on the unique constraint: the loser's insert
    /// is ignored and both read back the same row. A stored low-quality name
    /// is replaced when the incoming one is meaningful.
    pub async fn ensure_lead(
        &self,
        company_id: &str,
        phone: &str,
        name: Option<&str>,
    ) -> Result<Lead, GatewayError> {
        let name = name.filter(|n| is_meaningful_name(n, Some(phone)));

        sqlx::query(
            "INSERT OR IGNORE INTO leads (id, company_id, phone, name) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(company_id)
        .bind(phone)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("insert lead failed: {e}")))?;

        let mut lead = self
            .get_lead(company_id, phone)
            .await?
            .ok_or_else(|| GatewayError::Store(format!("lead {company_id}/{phone} vanished")))?;

        let stored_ok = lead
            .name
            .as_deref()
            .is_some_and(|n| is_meaningful_name(n, Some(phone)));
        if let (false, Some(new_name)) = (stored_ok, name) {
            sqlx::query("UPDATE leads SET name = ? WHERE id = ?")
                .bind(new_name)
                .bind(&lead.id)
                .execute(&self.pool)
                .await
                .map_err(|e| GatewayError::Store(format!("heal lead name failed: {e}")))?;
            lead.name = Some(new_name.to_string());
        }

        Ok(lead)
    }

    pub async fn get_lead(
        &self,
        company_id: &str,
        phone: &str,
    ) -> Result<Option<Lead>, GatewayError> {
        let row: Option<(String, String, String, Option<String>, String, Option<String>)> =
            sqlx::query_as(
                "SELECT id, company_id, phone, name, status, pipeline_stage_id \
                 FROM leads WHERE company_id = ? AND phone = ?",
            )
            .bind(company_id)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("get lead failed: {e}")))?;
        Ok(row.map(
            |(id, company_id, phone, name, status, pipeline_stage_id)| Lead {
                id,
                company_id,
                phone,
                name,
                status,
                pipeline_stage_id,
            },
        ))
    }

    pub async fn count_leads(&self, company_id: &str) -> Result<i64, GatewayError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM leads WHERE company_id = ?")
            .bind(company_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("count leads failed: {e}")))?;
        Ok(n)
    }
}
