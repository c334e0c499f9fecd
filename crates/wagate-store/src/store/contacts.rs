//! Contacts per (tenant, canonical JID).
//!
//! The display name is guarded: a placeholder or phone-shaped value never
//! replaces a stored name, and a push name only fills a name that is still
//! missing or low quality.

use super::{now_secs, Store};
use wagate_core::error::GatewayError;
use wagate_core::jid::is_meaningful_name;

/// Where an incoming display name came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    /// The user's address book, synced by the protocol layer.
    AddressBook,
    /// A business account's verified name.
    Verified,
    /// The self-chosen profile name sent along with messages.
    PushName,
}

/// Fields observed for a contact. `None` leaves the stored value untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactPatch {
    pub jid: String,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub name_source: NameSource,
    pub push_name: Option<String>,
    pub verified_name: Option<String>,
    pub is_business: Option<bool>,
    pub profile_pic_url: Option<String>,
}

impl ContactPatch {
    /// A patch carrying only a push name.
    pub fn push_name(jid: &str, phone: Option<String>, push_name: Option<&str>) -> Self {
        Self {
            jid: jid.to_string(),
            phone,
            name: push_name.map(str::to_string),
            name_source: NameSource::PushName,
            push_name: push_name.map(str::to_string),
            verified_name: None,
            is_business: None,
            profile_pic_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub company_id: String,
    pub jid: String,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub push_name: Option<String>,
    pub profile_pic_url: Option<String>,
    pub profile_pic_updated: Option<i64>,
    pub is_business: bool,
    pub verified_name: Option<String>,
    pub is_online: bool,
    pub last_seen_at: Option<i64>,
    pub is_ignored: bool,
}

type ContactRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    bool,
    Option<String>,
    bool,
    Option<i64>,
    bool,
);

/// Decide the display name to store given the current one and an incoming value.
fn resolve_name(
    current: Option<&str>,
    incoming: Option<&str>,
    source: NameSource,
    phone: Option<&str>,
) -> Option<String> {
    let incoming = incoming.filter(|n| is_meaningful_name(n, phone));
    let current_ok = current.filter(|n| is_meaningful_name(n, phone));
    match (incoming, source) {
        (Some(name), NameSource::AddressBook | NameSource::Verified) => Some(name.to_string()),
        (Some(name), NameSource::PushName) if current_ok.is_none() => Some(name.to_string()),
        _ => current.map(str::to_string),
    }
}

impl Store {
    /// Insert or update a contact, applying the name-quality rules.
    pub async fn upsert_contact(
        &self,
        company_id: &str,
        patch: &ContactPatch,
    ) -> Result<(), GatewayError> {
        let existing = self.get_contact(company_id, &patch.jid).await?;
        let phone = patch
            .phone
            .as_deref()
            .or(existing.as_ref().and_then(|c| c.phone.as_deref()));
        let name = resolve_name(
            existing.as_ref().and_then(|c| c.name.as_deref()),
            patch.name.as_deref(),
            patch.name_source,
            phone,
        );
        let push_name = patch
            .push_name
            .as_deref()
            .filter(|n| is_meaningful_name(n, phone));
        let pic_updated = patch.profile_pic_url.as_ref().map(|_| now_secs());

        sqlx::query(
            "INSERT INTO contacts (company_id, jid, phone, name, push_name, verified_name, \
             is_business, profile_pic_url, profile_pic_updated, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, COALESCE(?, 0), ?, ?, ?) \
             ON CONFLICT(company_id, jid) DO UPDATE SET \
             phone = COALESCE(excluded.phone, contacts.phone), \
             name = excluded.name, \
             push_name = COALESCE(excluded.push_name, contacts.push_name), \
             verified_name = COALESCE(excluded.verified_name, contacts.verified_name), \
             is_business = CASE WHEN ? IS NULL THEN contacts.is_business ELSE excluded.is_business END, \
             profile_pic_url = COALESCE(excluded.profile_pic_url, contacts.profile_pic_url), \
             profile_pic_updated = COALESCE(excluded.profile_pic_updated, contacts.profile_pic_updated), \
             updated_at = excluded.updated_at",
        )
        .bind(company_id)
        .bind(&patch.jid)
        .bind(phone)
        .bind(name)
        .bind(push_name)
        .bind(&patch.verified_name)
        .bind(patch.is_business)
        .bind(&patch.profile_pic_url)
        .bind(pic_updated)
        .bind(now_secs())
        .bind(patch.is_business)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("upsert contact failed: {e}")))?;
        Ok(())
    }

    pub async fn get_contact(
        &self,
        company_id: &str,
        jid: &str,
    ) -> Result<Option<Contact>, GatewayError> {
        let row: Option<ContactRow> = sqlx::query_as(
            "SELECT company_id, jid, phone, name, push_name, profile_pic_url, profile_pic_updated, \
             is_business, verified_name, is_online, last_seen_at, is_ignored \
             FROM contacts WHERE company_id = ? AND jid = ?",
        )
        .bind(company_id)
        .bind(jid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("get contact failed: {e}")))?;
        Ok(row.map(|r| Contact {
            company_id: r.0,
            jid: r.1,
            phone: r.2,
            name: r.3,
            push_name: r.4,
            profile_pic_url: r.5,
            profile_pic_updated: r.6,
            is_business: r.7,
            verified_name: r.8,
            is_online: r.9,
            last_seen_at: r.10,
            is_ignored: r.11,
        }))
    }

    /// Record presence. Creates a bare contact row when none exists yet.
    pub async fn set_presence(
        &self,
        company_id: &str,
        jid: &str,
        is_online: bool,
        last_seen_at: Option<i64>,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO contacts (company_id, jid, is_online, last_seen_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(company_id, jid) DO UPDATE SET \
             is_online = excluded.is_online, \
             last_seen_at = COALESCE(excluded.last_seen_at, contacts.last_seen_at), \
             updated_at = excluded.updated_at",
        )
        .bind(company_id)
        .bind(jid)
        .bind(is_online)
        .bind(last_seen_at)
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("set presence failed: {e}")))?;
        Ok(())
    }

    pub async fn set_contact_ignored(
        &self,
        company_id: &str,
        jid: &str,
        ignored: bool,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO contacts (company_id, jid, is_ignored, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(company_id, jid) DO UPDATE SET is_ignored = excluded.is_ignored",
        )
        .bind(company_id)
        .bind(jid)
        .bind(ignored)
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("set contact ignored failed: {e}")))?;
        Ok(())
    }

    /// Whether the tenant has blocked this conversation. Unknown contacts are not ignored.
    pub async fn is_contact_ignored(
        &self,
        company_id: &str,
        jid: &str,
    ) -> Result<bool, GatewayError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT is_ignored FROM contacts WHERE company_id = ? AND jid = ?")
                .bind(company_id)
                .bind(jid)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| GatewayError::Store(format!("check ignored failed: {e}")))?;
        Ok(row.is_some_and(|(ignored,)| ignored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_name_push_name_fills_only_gaps() {
        let phone = Some("5511999999999");
        assert_eq!(
            resolve_name(None, Some("Ana"), NameSource::PushName, phone).as_deref(),
            Some("Ana")
        );
        assert_eq!(
            resolve_name(Some("Ana Souza"), Some("Aninha"), NameSource::PushName, phone)
                .as_deref(),
            Some("Ana Souza")
        );
        assert_eq!(
            resolve_name(Some("5511999999999"), Some("Aninha"), NameSource::PushName, phone)
                .as_deref(),
            Some("Aninha")
        );
    }

    #[test]
    fn test_resolve_name_rejects_generic_values() {
        let phone = Some("5511999999999");
        assert_eq!(
            resolve_name(Some("Ana"), Some("Unknown"), NameSource::AddressBook, phone).as_deref(),
            Some("Ana")
        );
        assert_eq!(
            resolve_name(Some("Ana"), Some(""), NameSource::Verified, phone).as_deref(),
            Some("Ana")
        );
        assert_eq!(
            resolve_name(Some("Ana"), Some("Loja da Ana"), NameSource::Verified, phone).as_deref(),
            Some("Loja da Ana")
        );
    }
}
