//! Per-session credential storage.
//!
//! Every operation fails soft: a persistence error is logged and turned into
//! an empty result or a no-op, so a failed key write never takes down a live
//! connection.

use std::collections::HashMap;
use tracing::warn;
use wagate_store::{Store, CREDS_TYPE};

/// Key id of the root credential document.
const CREDS_KEY: &str = "root";

/// Serialized root credentials. Empty means "never paired".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials(pub Vec<u8>);

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One write in a key batch. `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWrite {
    pub data_type: String,
    pub key_id: String,
    pub value: Option<Vec<u8>>,
}

impl KeyWrite {
    pub fn put(data_type: &str, key_id: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            data_type: data_type.to_string(),
            key_id: key_id.into(),
            value: Some(value),
        }
    }

    pub fn delete(data_type: &str, key_id: impl Into<String>) -> Self {
        Self {
            data_type: data_type.to_string(),
            key_id: key_id.into(),
            value: None,
        }
    }
}

/// Fail-soft view of the `auth_state` table.
#[derive(Clone)]
pub struct AuthStateStore {
    store: Store,
}

impl AuthStateStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Stored credentials, or fresh empty ones.
    pub async fn load(&self, session_id: &str) -> Credentials {
        match self.store.get_auth(session_id, CREDS_TYPE, CREDS_KEY).await {
            Ok(Some(bytes)) => Credentials(bytes),
            Ok(None) => Credentials::default(),
            Err(e) => {
                warn!(session = session_id, "failed to load credentials: {e}");
                Credentials::default()
            }
        }
    }

    pub async fn save_creds(&self, session_id: &str, creds: &Credentials) {
        if let Err(e) = self
            .store
            .put_auth(session_id, CREDS_TYPE, CREDS_KEY, &creds.0)
            .await
        {
            warn!(session = session_id, "failed to save credentials: {e}");
        }
    }

    pub async fn has_creds(&self, session_id: &str) -> bool {
        !self.load(session_id).await.is_empty()
    }

    /// Values for the requested ids. Missing ids are simply absent.
    pub async fn get_keys(
        &self,
        session_id: &str,
        data_type: &str,
        ids: &[&str],
    ) -> HashMap<String, Vec<u8>> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.store.get_auth(session_id, data_type, id).await {
                Ok(Some(value)) => {
                    found.insert((*id).to_string(), value);
                }
                Ok(None) => {}
                Err(e) => warn!(session = session_id, "failed to read {data_type}/{id}: {e}"),
            }
        }
        found
    }

    /// Convenience for a single key.
    pub async fn get_key(&self, session_id: &str, data_type: &str, id: &str) -> Option<Vec<u8>> {
        self.get_keys(session_id, data_type, &[id]).await.remove(id)
    }

    pub async fn set_keys(&self, session_id: &str, batch: Vec<KeyWrite>) {
        if batch.is_empty() {
            return;
        }
        let writes: Vec<(String, String, Option<Vec<u8>>)> = batch
            .into_iter()
            .map(|w| (w.data_type, w.key_id, w.value))
            .collect();
        if let Err(e) = self.store.apply_auth_batch(session_id, &writes).await {
            warn!(session = session_id, "failed to write {} keys: {e}", writes.len());
        }
    }

    /// Every `(key_id, value)` of one type, newest first.
    pub async fn list(&self, session_id: &str, data_type: &str) -> Vec<(String, Vec<u8>)> {
        match self.store.list_auth(session_id, data_type).await {
            Ok(rows) => rows.into_iter().map(|r| (r.key_id, r.payload)).collect(),
            Err(e) => {
                warn!(session = session_id, "failed to list {data_type}: {e}");
                Vec::new()
            }
        }
    }

    /// Remove every record of a session.
    pub async fn clear(&self, session_id: &str) {
        match self.store.clear_auth(session_id).await {
            Ok(n) => tracing::info!(session = session_id, "wiped {n} credential rows"),
            Err(e) => warn!(session = session_id, "failed to wipe credentials: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn auth() -> AuthStateStore {
        AuthStateStore::new(Store::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_load_returns_fresh_credentials_when_unpaired() {
        let auth = auth().await;
        assert!(auth.load("s1").await.is_empty());
        assert!(!auth.has_creds("s1").await);

        auth.save_creds("s1", &Credentials(vec![1, 2, 3])).await;
        assert_eq!(auth.load("s1").await, Credentials(vec![1, 2, 3]));
        assert!(auth.has_creds("s1").await);
    }

    #[tokio::test]
    async fn test_get_keys_returns_only_present_ids() {
        let auth = auth().await;
        auth.set_keys(
            "s1",
            vec![
                KeyWrite::put("pre-key", "1", vec![1]),
                KeyWrite::put("pre-key", "2", vec![2]),
            ],
        )
        .await;

        let keys = auth.get_keys("s1", "pre-key", &["1", "3"]).await;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.get("1"), Some(&vec![1]));
    }

    #[tokio::test]
    async fn test_set_keys_null_value_deletes() {
        let auth = auth().await;
        auth.set_keys("s1", vec![KeyWrite::put("session", "a", vec![9])])
            .await;
        auth.set_keys("s1", vec![KeyWrite::delete("session", "a")])
            .await;
        assert!(auth.get_key("s1", "session", "a").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let auth = auth().await;
        auth.save_creds("s1", &Credentials(vec![1])).await;
        auth.set_keys("s1", vec![KeyWrite::put("session", "a", vec![9])])
            .await;
        auth.clear("s1").await;
        assert!(!auth.has_creds("s1").await);
        assert!(auth.list("s1", "session").await.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_soft() {
        let store = Store::in_memory().await.unwrap();
        store.pool().close().await;
        let auth = AuthStateStore::new(store);
        assert!(auth.load("s1").await.is_empty());
        assert!(auth.get_keys("s1", "pre-key", &["1"]).await.is_empty());
        auth.set_keys("s1", vec![KeyWrite::put("pre-key", "1", vec![1])])
            .await;
        auth.clear("s1").await;
    }
}
