//! Alias (LID) to phone-number mappings, per tenant.

use super::Store;
use wagate_core::error::GatewayError;

impl Store {
    /// Remember that `lid_jid` is the alias of `phone_jid`. The first mapping
    /// recorded for an alias is kept; later ones are ignored.
    pub async fn put_identity(
        &self,
        company_id: &str,
        lid_jid: &str,
        phone_jid: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO identity_map (company_id, lid_jid, phone_jid) VALUES (?, ?, ?) \
             ON CONFLICT(company_id, lid_jid) DO NOTHING",
        )
        .bind(company_id)
        .bind(lid_jid)
        .bind(phone_jid)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("put identity failed: {e}")))?;
        Ok(())
    }

    /// The phone JID behind an alias, if known.
    pub async fn resolve_alias(
        &self,
        company_id: &str,
        lid_jid: &str,
    ) -> Result<Option<String>, GatewayError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT phone_jid FROM identity_map WHERE company_id = ? AND lid_jid = ?",
        )
        .bind(company_id)
        .bind(lid_jid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("resolve alias failed: {e}")))?;
        Ok(row.map(|(p,)| p))
    }
}
