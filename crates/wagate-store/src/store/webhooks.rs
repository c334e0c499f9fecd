//! Per-tenant webhook targets.

use super::Store;
use wagate_core::error::GatewayError;

impl Store {
    pub async fn set_webhook(
        &self,
        company_id: &str,
        url: &str,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO company_webhooks (company_id, url, enabled) VALUES (?, ?, ?) \
             ON CONFLICT(company_id) DO UPDATE SET url = excluded.url, enabled = excluded.enabled",
        )
        .bind(company_id)
        .bind(url)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("set webhook failed: {e}")))?;
        Ok(())
    }

    /// The tenant's enabled webhook URL, if any.
    pub async fn webhook_url(&self, company_id: &str) -> Result<Option<String>, GatewayError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT url FROM company_webhooks WHERE company_id = ? AND enabled = 1 AND url <> ''",
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("webhook lookup failed: {e}")))?;
        Ok(row.map(|(u,)| u))
    }
}
