//! Tenant-visible session status rows.

use super::{now_secs, Store};
use wagate_core::error::GatewayError;

pub const STATUS_CONNECTING: &str = "connecting";
pub const STATUS_QR_READY: &str = "qr_ready";
pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_DISCONNECTED: &str = "disconnected";
pub const STATUS_LOGGED_OUT: &str = "logged_out";

/// One session's externally visible state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub session_id: String,
    pub company_id: String,
    pub status: String,
    pub qrcode_url: Option<String>,
    pub sync_status: Option<String>,
    pub sync_percent: i64,
    pub profile_name: Option<String>,
    pub profile_pic_url: Option<String>,
    pub owner_jid: Option<String>,
    pub updated_at: i64,
}

type InstanceRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
);

const INSTANCE_COLUMNS: &str = "session_id, company_id, status, qrcode_url, sync_status, \
     sync_percent, profile_name, profile_pic_url, owner_jid, updated_at";

fn instance_from_row(row: InstanceRow) -> Instance {
    Instance {
        session_id: row.0,
        company_id: row.1,
        status: row.2,
        qrcode_url: row.3,
        sync_status: row.4,
        sync_percent: row.5,
        profile_name: row.6,
        profile_pic_url: row.7,
        owner_jid: row.8,
        updated_at: row.9,
    }
}

impl Store {
    /// Create the row for a session or re-point it at a tenant, setting `status`.
    pub async fn register_instance(
        &self,
        session_id: &str,
        company_id: &str,
        status: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO instances (session_id, company_id, status, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET \
             company_id = excluded.company_id, status = excluded.status, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(company_id)
        .bind(status)
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("register instance failed: {e}")))?;
        Ok(())
    }

    pub async fn set_instance_status(
        &self,
        session_id: &str,
        status: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE instances SET status = ?, updated_at = ? WHERE session_id = ?")
            .bind(status)
            .bind(now_secs())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("set instance status failed: {e}")))?;
        Ok(())
    }

    /// Persist a scan payload and flip the status to `qr_ready`.
    pub async fn set_instance_qr(&self, session_id: &str, qr: &str) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE instances SET status = ?, qrcode_url = ?, updated_at = ? WHERE session_id = ?",
        )
        .bind(STATUS_QR_READY)
        .bind(qr)
        .bind(now_secs())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("set instance qr failed: {e}")))?;
        Ok(())
    }

    /// Mark connected and clear any scan payload.
    pub async fn mark_instance_connected(&self, session_id: &str) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE instances SET status = ?, qrcode_url = NULL, updated_at = ? WHERE session_id = ?",
        )
        .bind(STATUS_CONNECTED)
        .bind(now_secs())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("mark instance connected failed: {e}")))?;
        Ok(())
    }

    /// Store the account's own profile. `None` leaves a field untouched.
    pub async fn set_instance_profile(
        &self,
        session_id: &str,
        owner_jid: Option<&str>,
        profile_name: Option<&str>,
        profile_pic_url: Option<&str>,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE instances SET \
             owner_jid = COALESCE(?, owner_jid), \
             profile_name = COALESCE(?, profile_name), \
             profile_pic_url = COALESCE(?, profile_pic_url), \
             updated_at = ? WHERE session_id = ?",
        )
        .bind(owner_jid)
        .bind(profile_name)
        .bind(profile_pic_url)
        .bind(now_secs())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("set instance profile failed: {e}")))?;
        Ok(())
    }

    /// Record backfill progress, clamped to 0..=100.
    pub async fn set_sync_progress(
        &self,
        session_id: &str,
        sync_status: &str,
        percent: u8,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE instances SET sync_status = ?, sync_percent = ?, updated_at = ? WHERE session_id = ?",
        )
        .bind(sync_status)
        .bind(i64::from(percent.min(100)))
        .bind(now_secs())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("set sync progress failed: {e}")))?;
        Ok(())
    }

    pub async fn get_instance(&self, session_id: &str) -> Result<Option<Instance>, GatewayError> {
        let row: Option<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("get instance failed: {e}")))?;
        Ok(row.map(instance_from_row))
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>, GatewayError> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY company_id, session_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("list instances failed: {e}")))?;
        Ok(rows.into_iter().map(instance_from_row).collect())
    }
}
