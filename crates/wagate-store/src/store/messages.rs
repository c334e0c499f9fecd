//! Message rows: idempotent upserts keyed by (tenant, conversation, protocol id),
//! monotonic receipt status, and per-message reaction and poll-vote lists.

use super::Store;
use wagate_core::error::GatewayError;
use wagate_core::message::{
    apply_poll_vote, apply_reaction, MessageRecord, MessageStatus, PollVote, Reaction,
    StructuredContent,
};

/// A message row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub company_id: String,
    pub session_id: String,
    pub remote_jid: String,
    pub whatsapp_id: String,
    pub from_me: bool,
    pub participant: Option<String>,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub status: MessageStatus,
    pub structured: Option<StructuredContent>,
    pub reactions: Vec<Reaction>,
    pub poll_votes: Vec<PollVote>,
    /// Unix seconds.
    pub created_at: i64,
}

type MessageRow = (
    String,
    String,
    String,
    String,
    bool,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
    i64,
);

const MESSAGE_COLUMNS: &str = "company_id, session_id, remote_jid, whatsapp_id, from_me, \
     participant, content, message_type, media_url, status, structured, reactions, poll_votes, created_at";

fn message_from_row(row: MessageRow) -> StoredMessage {
    StoredMessage {
        company_id: row.0,
        session_id: row.1,
        remote_jid: row.2,
        whatsapp_id: row.3,
        from_me: row.4,
        participant: row.5,
        content: row.6,
        message_type: row.7,
        media_url: row.8,
        status: MessageStatus::parse(&row.9).unwrap_or(MessageStatus::Sent),
        structured: row.10.and_then(|s| serde_json::from_str(&s).ok()),
        reactions: serde_json::from_str(&row.11).unwrap_or_default(),
        poll_votes: serde_json::from_str(&row.12).unwrap_or_default(),
        created_at: row.13,
    }
}

/// SQL expression ranking a status column so updates can compare order.
fn status_rank_sql(column: &str) -> String {
    let arms: String = [
        MessageStatus::Pending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
        MessageStatus::Played,
    ]
    .iter()
    .map(|s| format!(" WHEN '{}' THEN {}", s.as_str(), s.rank()))
    .collect();
    format!("(CASE {column}{arms} ELSE 0 END)")
}

impl Store {
    /// Insert a message or overwrite the existing row with this delivery.
    ///
    /// Redelivery never duplicates the row and never moves the status
    /// backwards. Returns `true` only for the call whose insert created the
    /// row, so concurrent duplicates agree on a single creator.
    pub async fn upsert_message(&self, record: &MessageRecord) -> Result<bool, GatewayError> {
        let structured = record
            .structured
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let inserted = sqlx::query(
            "INSERT INTO messages (company_id, session_id, remote_jid, whatsapp_id, from_me, \
             participant, content, message_type, media_url, status, structured, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(company_id, remote_jid, whatsapp_id) DO NOTHING",
        )
        .bind(&record.company_id)
        .bind(&record.session_id)
        .bind(&record.remote_jid)
        .bind(&record.whatsapp_id)
        .bind(record.from_me)
        .bind(&record.participant)
        .bind(&record.content)
        .bind(record.message_type.as_str())
        .bind(&record.media_url)
        .bind(record.status.as_str())
        .bind(&structured)
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("insert message failed: {e}")))?;
        if inserted.rows_affected() == 1 {
            return Ok(true);
        }

        let sql = format!(
            "UPDATE messages SET content = ?, message_type = ?, created_at = ?, \
             participant = COALESCE(?, participant), \
             media_url = COALESCE(?, media_url), \
             structured = COALESCE(?, structured), \
             status = CASE WHEN ? > {} THEN ? ELSE status END \
             WHERE company_id = ? AND remote_jid = ? AND whatsapp_id = ?",
            status_rank_sql("status"),
        );
        sqlx::query(&sql)
            .bind(&record.content)
            .bind(record.message_type.as_str())
            .bind(record.created_at.timestamp())
            .bind(&record.participant)
            .bind(&record.media_url)
            .bind(&structured)
            .bind(record.status.rank())
            .bind(record.status.as_str())
            .bind(&record.company_id)
            .bind(&record.remote_jid)
            .bind(&record.whatsapp_id)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("update message failed: {e}")))?;

        Ok(false)
    }

    /// Move the given messages forward to `status`. Rows already at or past
    /// it are untouched. Returns how many rows changed.
    pub async fn advance_message_status(
        &self,
        company_id: &str,
        whatsapp_ids: &[String],
        status: MessageStatus,
    ) -> Result<u64, GatewayError> {
        let sql = format!(
            "UPDATE messages SET status = ? WHERE company_id = ? AND whatsapp_id = ? AND {} < ?",
            status_rank_sql("status")
        );
        let mut changed = 0;
        for id in whatsapp_ids {
            let result = sqlx::query(&sql)
                .bind(status.as_str())
                .bind(company_id)
                .bind(id)
                .bind(status.rank())
                .execute(&self.pool)
                .await
                .map_err(|e| GatewayError::Store(format!("advance status failed: {e}")))?;
            changed += result.rows_affected();
        }
        Ok(changed)
    }

    /// Apply one reaction to a message. Returns `false` if the target is unknown.
    pub async fn apply_message_reaction(
        &self,
        company_id: &str,
        remote_jid: &str,
        whatsapp_id: &str,
        actor: &str,
        emoji: &str,
    ) -> Result<bool, GatewayError> {
        self.mutate_json_list::<Reaction, _>(
            company_id,
            remote_jid,
            whatsapp_id,
            "reactions",
            |list| apply_reaction(list, actor, emoji),
        )
        .await
    }

    /// Record a voter's current selection. Returns `false` if the poll is unknown.
    pub async fn apply_message_poll_vote(
        &self,
        company_id: &str,
        remote_jid: &str,
        whatsapp_id: &str,
        voter: &str,
        options: &[String],
    ) -> Result<bool, GatewayError> {
        self.mutate_json_list::<PollVote, _>(
            company_id,
            remote_jid,
            whatsapp_id,
            "poll_votes",
            |list| apply_poll_vote(list, voter, options),
        )
        .await
    }

    /// Read-modify-write of a JSON list column inside one transaction.
    async fn mutate_json_list<T, F>(
        &self,
        company_id: &str,
        remote_jid: &str,
        whatsapp_id: &str,
        column: &'static str,
        mutate: F,
    ) -> Result<bool, GatewayError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnOnce(&mut Vec<T>),
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GatewayError::Store(format!("begin {column} update failed: {e}")))?;

        let row: Option<(i64, String)> = sqlx::query_as(&format!(
            "SELECT id, {column} FROM messages \
             WHERE company_id = ? AND remote_jid = ? AND whatsapp_id = ?"
        ))
        .bind(company_id)
        .bind(remote_jid)
        .bind(whatsapp_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| GatewayError::Store(format!("read {column} failed: {e}")))?;

        let Some((id, raw)) = row else {
            return Ok(false);
        };
        let mut list: Vec<T> = serde_json::from_str(&raw).unwrap_or_default();
        mutate(&mut list);
        let encoded = serde_json::to_string(&list)?;

        sqlx::query(&format!("UPDATE messages SET {column} = ? WHERE id = ?"))
            .bind(encoded)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| GatewayError::Store(format!("write {column} failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| GatewayError::Store(format!("commit {column} update failed: {e}")))?;
        Ok(true)
    }

    /// Replace a message's text, e.g. with an audio transcript.
    pub async fn set_message_content(
        &self,
        company_id: &str,
        remote_jid: &str,
        whatsapp_id: &str,
        content: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE messages SET content = ? \
             WHERE company_id = ? AND remote_jid = ? AND whatsapp_id = ?",
        )
        .bind(content)
        .bind(company_id)
        .bind(remote_jid)
        .bind(whatsapp_id)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("set message content failed: {e}")))?;
        Ok(())
    }

    pub async fn get_message(
        &self,
        company_id: &str,
        whatsapp_id: &str,
    ) -> Result<Option<StoredMessage>, GatewayError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE company_id = ? AND whatsapp_id = ? LIMIT 1"
        ))
        .bind(company_id)
        .bind(whatsapp_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("get message failed: {e}")))?;
        Ok(row.map(message_from_row))
    }

    pub async fn count_messages(&self, company_id: &str) -> Result<i64, GatewayError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE company_id = ?")
            .bind(company_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("count messages failed: {e}")))?;
        Ok(n)
    }
}
