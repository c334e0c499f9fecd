//! Credential blobs keyed by (session, data type, key id).

use super::{now_secs, Store};
use wagate_core::error::GatewayError;

/// Key id used for the primary credential document of a session.
pub const CREDS_TYPE: &str = "creds";

/// One stored credential record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRow {
    pub key_id: String,
    pub payload: Vec<u8>,
    pub updated_at: i64,
}

impl Store {
    /// Read one blob.
    pub async fn get_auth(
        &self,
        session_id: &str,
        data_type: &str,
        key_id: &str,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT payload FROM auth_state WHERE session_id = ? AND data_type = ? AND key_id = ?",
        )
        .bind(session_id)
        .bind(data_type)
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("get auth failed: {e}")))?;
        Ok(row.map(|(p,)| p))
    }

    /// Read every row of one data type, newest first.
    pub async fn list_auth(
        &self,
        session_id: &str,
        data_type: &str,
    ) -> Result<Vec<AuthRow>, GatewayError> {
        let rows: Vec<(String, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT key_id, payload, updated_at FROM auth_state \
             WHERE session_id = ? AND data_type = ? ORDER BY updated_at DESC, key_id",
        )
        .bind(session_id)
        .bind(data_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("list auth failed: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|(key_id, payload, updated_at)| AuthRow {
                key_id,
                payload,
                updated_at,
            })
            .collect())
    }

    /// Insert or replace one blob.
    pub async fn put_auth(
        &self,
        session_id: &str,
        data_type: &str,
        key_id: &str,
        payload: &[u8],
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO auth_state (session_id, data_type, key_id, payload, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(session_id, data_type, key_id) \
             DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(data_type)
        .bind(key_id)
        .bind(payload)
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("put auth failed: {e}")))?;
        Ok(())
    }

    pub async fn delete_auth(
        &self,
        session_id: &str,
        data_type: &str,
        key_id: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("DELETE FROM auth_state WHERE session_id = ? AND data_type = ? AND key_id = ?")
            .bind(session_id)
            .bind(data_type)
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("delete auth failed: {e}")))?;
        Ok(())
    }

    /// Apply a batch of writes atomically. `None` deletes the key.
    pub async fn apply_auth_batch(
        &self,
        session_id: &str,
        writes: &[(String, String, Option<Vec<u8>>)],
    ) -> Result<(), GatewayError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GatewayError::Store(format!("begin auth batch failed: {e}")))?;
        let now = now_secs();
        for (data_type, key_id, payload) in writes {
            let result = match payload {
                Some(bytes) => {
                    sqlx::query(
                        "INSERT INTO auth_state (session_id, data_type, key_id, payload, updated_at) \
                         VALUES (?, ?, ?, ?, ?) \
                         ON CONFLICT(session_id, data_type, key_id) \
                         DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                    )
                    .bind(session_id)
                    .bind(data_type)
                    .bind(key_id)
                    .bind(bytes.as_slice())
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                }
                None => {
                    sqlx::query(
                        "DELETE FROM auth_state WHERE session_id = ? AND data_type = ? AND key_id = ?",
                    )
                    .bind(session_id)
                    .bind(data_type)
                    .bind(key_id)
                    .execute(&mut *tx)
                    .await
                }
            };
            result.map_err(|e| GatewayError::Store(format!("auth batch write failed: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| GatewayError::Store(format!("commit auth batch failed: {e}")))?;
        Ok(())
    }

    /// Delete every record of a session. Returns the number of rows removed.
    pub async fn clear_auth(&self, session_id: &str) -> Result<u64, GatewayError> {
        let result = sqlx::query("DELETE FROM auth_state WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("clear auth failed: {e}")))?;
        Ok(result.rows_affected())
    }

    /// Sessions that have a stored credential document.
    pub async fn list_auth_sessions(&self) -> Result<Vec<String>, GatewayError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT session_id FROM auth_state WHERE data_type = ? ORDER BY session_id",
        )
        .bind(CREDS_TYPE)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("list auth sessions failed: {e}")))?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }
}
