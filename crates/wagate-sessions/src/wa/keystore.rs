//! `whatsapp-rust` storage backend over the per-session `auth_state` table.
//!
//! Every library store maps onto `(data_type, key_id) -> bytes` rows of one
//! session, so a single `clear` wipes the whole device. Lid/phone mappings
//! learned by the library are mirrored into the tenant's identity map.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wacore::appstate::hash::HashState;
use wacore::appstate::processor::AppStateMutationMAC;
use wacore::store::error::StoreError;
use wacore::store::traits::{
    AppStateSyncKey, AppSyncStore, DeviceListRecord, DeviceStore, LidPnMappingEntry, ProtocolStore,
    SignalStore,
};
use wacore::store::Device;
use wagate_core::event::ProtocolEvent;
use wagate_core::jid;
use wagate_store::Store;

use crate::auth::{AuthStateStore, Credentials, KeyWrite};

type Result<T> = wacore::store::error::Result<T>;

const IDENTITY: &str = "identity";
const SESSION: &str = "session";
const PRE_KEY: &str = "pre-key";
const SIGNED_PRE_KEY: &str = "signed-pre-key";
const SENDER_KEY: &str = "sender-key";
const SYNC_KEY: &str = "app-state-sync-key";
const SYNC_VERSION: &str = "app-state-version";
const MUTATION_MAC: &str = "app-state-mac";
const SKDM: &str = "skdm-recipients";
const LID_MAPPING: &str = "lid-mapping";
const BASE_KEY: &str = "base-key";
const DEVICE_LIST: &str = "device-list";
const FORGET_MARKS: &str = "forget-sender-key";
const DEVICE: &str = "device";
const DEVICE_KEY: &str = "1";

#[derive(Serialize, Deserialize)]
struct SyncKeyRecord {
    key_data: Vec<u8>,
    timestamp: i64,
    fingerprint: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct LidMappingRecord {
    phone_number: String,
    created_at: i64,
    updated_at: i64,
    learning_source: String,
}

impl LidMappingRecord {
    fn into_entry(self, lid: String) -> LidPnMappingEntry {
        LidPnMappingEntry {
            lid,
            phone_number: self.phone_number,
            created_at: self.created_at,
            updated_at: self.updated_at,
            learning_source: self.learning_source,
        }
    }
}

/// What the paired device says about itself.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    pub jid: Option<String>,
    pub push_name: Option<String>,
}

pub struct SessionKeyStore {
    session_id: String,
    company_id: String,
    auth: AuthStateStore,
    store: Store,
    events: mpsc::Sender<ProtocolEvent>,
    identity: Mutex<DeviceIdentity>,
}

impl SessionKeyStore {
    pub fn new(
        session_id: &str,
        company_id: &str,
        auth: AuthStateStore,
        store: Store,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            company_id: company_id.to_string(),
            auth,
            store,
            events,
            identity: Mutex::new(DeviceIdentity::default()),
        }
    }

    /// Last identity seen in a device save.
    pub fn device_identity(&self) -> DeviceIdentity {
        match self.identity.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn get(&self, data_type: &str, key_id: &str) -> Option<Vec<u8>> {
        self.auth.get_key(&self.session_id, data_type, key_id).await
    }

    async fn put(&self, data_type: &str, key_id: &str, value: Vec<u8>) {
        self.auth
            .set_keys(&self.session_id, vec![KeyWrite::put(data_type, key_id, value)])
            .await;
    }

    async fn delete(&self, data_type: &str, key_id: &str) {
        self.auth
            .set_keys(&self.session_id, vec![KeyWrite::delete(data_type, key_id)])
            .await;
    }

    async fn get_json<T: DeserializeOwned>(&self, data_type: &str, key_id: &str) -> Result<Option<T>> {
        match self.get(data_type, key_id).await {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, data_type: &str, key_id: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put(data_type, key_id, bytes).await;
        Ok(())
    }

    async fn rotated(&self) {
        if self.events.try_send(ProtocolEvent::CredentialsRotated).is_err() {
            debug!(session = %self.session_id, "event channel busy, dropped rotation notice");
        }
    }

    fn remember_identity(&self, device: &Device) {
        let identity = DeviceIdentity {
            jid: device.pn.as_ref().map(|j| jid::normalize(&j.to_string())),
            push_name: Some(device.push_name.clone()).filter(|n| !n.trim().is_empty()),
        };
        match self.identity.lock() {
            Ok(mut guard) => *guard = identity,
            Err(poisoned) => *poisoned.into_inner() = identity,
        }
    }
}

fn mac_key(collection: &str, index_mac: &[u8]) -> String {
    let hex: String = index_mac.iter().map(|b| format!("{b:02x}")).collect();
    format!("{collection}:{hex}")
}

fn base_key_id(address: &str, message_id: &str) -> String {
    format!("{address}|{message_id}")
}

#[async_trait]
impl SignalStore for SessionKeyStore {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()> {
        self.put(IDENTITY, address, key.to_vec()).await;
        Ok(())
    }

    async fn load_identity(&self, address: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(IDENTITY, address).await)
    }

    async fn delete_identity(&self, address: &str) -> Result<()> {
        self.delete(IDENTITY, address).await;
        Ok(())
    }

    async fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(SESSION, address).await)
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> Result<()> {
        self.put(SESSION, address, session.to_vec()).await;
        Ok(())
    }

    async fn delete_session(&self, address: &str) -> Result<()> {
        self.delete(SESSION, address).await;
        Ok(())
    }

    async fn store_prekey(&self, id: u32, record: &[u8], _uploaded: bool) -> Result<()> {
        self.put(PRE_KEY, &id.to_string(), record.to_vec()).await;
        Ok(())
    }

    async fn load_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.get(PRE_KEY, &id.to_string()).await)
    }

    async fn remove_prekey(&self, id: u32) -> Result<()> {
        self.delete(PRE_KEY, &id.to_string()).await;
        Ok(())
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> Result<()> {
        self.put(SIGNED_PRE_KEY, &id.to_string(), record.to_vec()).await;
        Ok(())
    }

    async fn load_signed_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.get(SIGNED_PRE_KEY, &id.to_string()).await)
    }

    async fn load_all_signed_prekeys(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        Ok(self
            .auth
            .list(&self.session_id, SIGNED_PRE_KEY)
            .await
            .into_iter()
            .filter_map(|(id, record)| id.parse::<u32>().ok().map(|id| (id, record)))
            .collect())
    }

    async fn remove_signed_prekey(&self, id: u32) -> Result<()> {
        self.delete(SIGNED_PRE_KEY, &id.to_string()).await;
        Ok(())
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> Result<()> {
        self.put(SENDER_KEY, address, record.to_vec()).await;
        Ok(())
    }

    async fn get_sender_key(&self, address: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(SENDER_KEY, address).await)
    }

    async fn delete_sender_key(&self, address: &str) -> Result<()> {
        self.delete(SENDER_KEY, address).await;
        Ok(())
    }
}

#[async_trait]
impl AppSyncStore for SessionKeyStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<AppStateSyncKey>> {
        let record: Option<SyncKeyRecord> = self.get_json(SYNC_KEY, &mac_key("", key_id)).await?;
        Ok(record.map(|r| AppStateSyncKey {
            key_data: r.key_data,
            timestamp: r.timestamp,
            fingerprint: r.fingerprint,
        }))
    }

    async fn set_sync_key(&self, key_id: &[u8], key: AppStateSyncKey) -> Result<()> {
        let record = SyncKeyRecord {
            key_data: key.key_data,
            timestamp: key.timestamp,
            fingerprint: key.fingerprint,
        };
        self.put_json(SYNC_KEY, &mac_key("", key_id), &record).await
    }

    async fn get_version(&self, name: &str) -> Result<HashState> {
        Ok(self.get_json(SYNC_VERSION, name).await?.unwrap_or_default())
    }

    async fn set_version(&self, name: &str, state: HashState) -> Result<()> {
        self.put_json(SYNC_VERSION, name, &state).await
    }

    async fn put_mutation_macs(
        &self,
        name: &str,
        _version: u64,
        mutations: &[AppStateMutationMAC],
    ) -> Result<()> {
        let batch = mutations
            .iter()
            .map(|m| KeyWrite::put(MUTATION_MAC, mac_key(name, &m.index_mac), m.value_mac.clone()))
            .collect();
        self.auth.set_keys(&self.session_id, batch).await;
        Ok(())
    }

    async fn get_mutation_mac(&self, name: &str, index_mac: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get(MUTATION_MAC, &mac_key(name, index_mac)).await)
    }

    async fn delete_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> Result<()> {
        let batch = index_macs
            .iter()
            .map(|mac| KeyWrite::delete(MUTATION_MAC, mac_key(name, mac)))
            .collect();
        self.auth.set_keys(&self.session_id, batch).await;
        Ok(())
    }
}

#[async_trait]
impl ProtocolStore for SessionKeyStore {
    async fn get_skdm_recipients(&self, group_jid: &str) -> Result<Vec<String>> {
        Ok(self.get_json(SKDM, group_jid).await?.unwrap_or_default())
    }

    async fn add_skdm_recipients(&self, group_jid: &str, device_jids: &[String]) -> Result<()> {
        let mut recipients = self.get_skdm_recipients(group_jid).await?;
        for device in device_jids {
            if !recipients.contains(device) {
                recipients.push(device.clone());
            }
        }
        self.put_json(SKDM, group_jid, &recipients).await
    }

    async fn clear_skdm_recipients(&self, group_jid: &str) -> Result<()> {
        self.delete(SKDM, group_jid).await;
        Ok(())
    }

    async fn get_lid_mapping(&self, lid: &str) -> Result<Option<LidPnMappingEntry>> {
        let record: Option<LidMappingRecord> = self.get_json(LID_MAPPING, lid).await?;
        Ok(record.map(|r| r.into_entry(lid.to_string())))
    }

    async fn get_pn_mapping(&self, phone: &str) -> Result<Option<LidPnMappingEntry>> {
        Ok(self
            .get_all_lid_mappings()
            .await?
            .into_iter()
            .find(|entry| entry.phone_number == phone))
    }

    async fn put_lid_mapping(&self, entry: &LidPnMappingEntry) -> Result<()> {
        let record = LidMappingRecord {
            phone_number: entry.phone_number.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            learning_source: entry.learning_source.clone(),
        };
        self.put_json(LID_MAPPING, &entry.lid, &record).await?;

        let alias = format!("{}@lid", jid::user_part(&entry.lid));
        let phone = format!("{}@s.whatsapp.net", jid::user_part(&entry.phone_number));
        if let Err(e) = self.store.put_identity(&self.company_id, &alias, &phone).await {
            warn!(session = %self.session_id, "failed to mirror identity {alias}: {e}");
        }
        Ok(())
    }

    async fn get_all_lid_mappings(&self) -> Result<Vec<LidPnMappingEntry>> {
        let mut entries = Vec::new();
        for (lid, bytes) in self.auth.list(&self.session_id, LID_MAPPING).await {
            let record: LidMappingRecord = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            entries.push(record.into_entry(lid));
        }
        Ok(entries)
    }

    async fn save_base_key(&self, address: &str, message_id: &str, base_key: &[u8]) -> Result<()> {
        self.put(BASE_KEY, &base_key_id(address, message_id), base_key.to_vec())
            .await;
        Ok(())
    }

    async fn has_same_base_key(
        &self,
        address: &str,
        message_id: &str,
        current_base_key: &[u8],
    ) -> Result<bool> {
        Ok(self
            .get(BASE_KEY, &base_key_id(address, message_id))
            .await
            .is_some_and(|k| k == current_base_key))
    }

    async fn delete_base_key(&self, address: &str, message_id: &str) -> Result<()> {
        self.delete(BASE_KEY, &base_key_id(address, message_id)).await;
        Ok(())
    }

    async fn update_device_list(&self, record: DeviceListRecord) -> Result<()> {
        let user = record.user.clone();
        self.put_json(DEVICE_LIST, &user, &record).await
    }

    async fn get_devices(&self, user: &str) -> Result<Option<DeviceListRecord>> {
        self.get_json(DEVICE_LIST, user).await
    }

    async fn mark_forget_sender_key(&self, group_jid: &str, participant: &str) -> Result<()> {
        let mut marks: Vec<String> = self.get_json(FORGET_MARKS, group_jid).await?.unwrap_or_default();
        if !marks.iter().any(|p| p == participant) {
            marks.push(participant.to_string());
        }
        self.put_json(FORGET_MARKS, group_jid, &marks).await
    }

    async fn consume_forget_marks(&self, group_jid: &str) -> Result<Vec<String>> {
        let marks = self.get_json(FORGET_MARKS, group_jid).await?.unwrap_or_default();
        self.delete(FORGET_MARKS, group_jid).await;
        Ok(marks)
    }
}

#[async_trait]
impl DeviceStore for SessionKeyStore {
    async fn save(&self, device: &Device) -> Result<()> {
        // Device keys use custom serde that needs a binary format.
        let data =
            bincode::serialize(device).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.remember_identity(device);
        self.put(DEVICE, DEVICE_KEY, data.clone()).await;
        // Root credentials exist only once the device is linked to an account.
        if device.pn.is_some() {
            self.auth.save_creds(&self.session_id, &Credentials(data)).await;
        }
        self.rotated().await;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Device>> {
        match self.get(DEVICE, DEVICE_KEY).await {
            Some(data) => {
                let device: Device = bincode::deserialize(&data)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.remember_identity(&device);
                Ok(Some(device))
            }
            None => Ok(None),
        }
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.get(DEVICE, DEVICE_KEY).await.is_some())
    }

    async fn create(&self) -> Result<i32> {
        Ok(1)
    }
}
