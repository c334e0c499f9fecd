//! Narrow event handlers: receipts, reactions, poll votes, contact sync,
//! presence and identity mappings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use wagate_core::event::{
    MessageKey, PollVoteUpdate, PresenceUpdate, RawContact, ReactionUpdate, ReceiptUpdate,
};
use wagate_core::jid;
use wagate_store::{ContactPatch, NameSource, Store};

use crate::ingest::resolve_conversation;

#[derive(Clone)]
pub struct EventHandlers {
    store: Store,
    presence: PresenceDebouncer,
}

impl EventHandlers {
    pub fn new(store: Store, presence_window: Duration) -> Self {
        Self {
            presence: PresenceDebouncer::new(store.clone(), presence_window),
            store,
        }
    }

    /// Advance message statuses. Echoes of our own read markers are dropped.
    pub async fn on_receipts(&self, company_id: &str, receipts: &[ReceiptUpdate]) -> u64 {
        let mut changed = 0;
        for receipt in receipts.iter().filter(|r| !r.from_self) {
            match self
                .store
                .advance_message_status(company_id, &receipt.message_ids, receipt.status)
                .await
            {
                Ok(n) => changed += n,
                Err(e) => warn!("receipt for {} failed: {e}", receipt.remote_jid),
            }
        }
        changed
    }

    pub async fn on_reactions(&self, company_id: &str, reactions: &[ReactionUpdate]) {
        for reaction in reactions {
            let actor = jid::normalize(&reaction.actor);
            let chat = self.target_chat(company_id, &reaction.target).await;
            match self
                .store
                .apply_message_reaction(company_id, &chat, &reaction.target.id, &actor, &reaction.emoji)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!("reaction to unknown message {}", reaction.target.id),
                Err(e) => warn!("reaction to {} failed: {e}", reaction.target.id),
            }
        }
    }

    pub async fn on_poll_votes(&self, company_id: &str, votes: &[PollVoteUpdate]) {
        for vote in votes {
            let voter = jid::normalize(&vote.voter);
            let chat = self.target_chat(company_id, &vote.target).await;
            match self
                .store
                .apply_message_poll_vote(company_id, &chat, &vote.target.id, &voter, &vote.options)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!("vote on unknown poll {}", vote.target.id),
                Err(e) => warn!("vote on {} failed: {e}", vote.target.id),
            }
        }
    }

    /// The stored conversation a reaction or vote points at.
    async fn target_chat(&self, company_id: &str, target: &MessageKey) -> String {
        resolve_conversation(
            &self.store,
            company_id,
            &target.remote_jid,
            target.remote_jid_alt.as_deref(),
        )
        .await
    }

    /// Apply a contact batch. Named 1:1 contacts also get a lead. Returns how
    /// many contacts were written.
    pub async fn on_contacts(
        &self,
        company_id: &str,
        contacts: &[RawContact],
        own_phone: Option<&str>,
    ) -> usize {
        let mut written = 0;
        for contact in contacts {
            if self.upsert_contact(company_id, contact, own_phone).await {
                written += 1;
            }
        }
        written
    }

    async fn upsert_contact(
        &self,
        company_id: &str,
        contact: &RawContact,
        own_phone: Option<&str>,
    ) -> bool {
        let mut id = jid::normalize(&contact.id);
        if jid::is_group(&id) || jid::is_ignored_conversation(&id) {
            return false;
        }

        // Record whichever alias/phone pair the batch reveals.
        let lid = contact.lid.as_deref().map(jid::normalize);
        if let Some(lid) = lid.as_deref().filter(|l| jid::is_lid(l)) {
            if jid::phone_of(&id).is_some() {
                self.on_identity_mapping(company_id, lid, &id).await;
            }
        }
        if jid::is_lid(&id) {
            if let Ok(Some(phone_jid)) = self.store.resolve_alias(company_id, &id).await {
                id = phone_jid;
            }
        }

        let phone = jid::phone_of(&id);
        let (name, name_source) = match (&contact.name, &contact.verified_name, &contact.notify) {
            (Some(name), _, _) => (Some(name.clone()), NameSource::AddressBook),
            (None, Some(verified), _) => (Some(verified.clone()), NameSource::Verified),
            (None, None, notify) => (notify.clone(), NameSource::PushName),
        };
        let patch = ContactPatch {
            jid: id.clone(),
            phone: phone.clone(),
            name: name.clone(),
            name_source,
            push_name: contact.notify.clone(),
            verified_name: contact.verified_name.clone(),
            is_business: contact.verified_name.as_ref().map(|_| true),
            profile_pic_url: contact
                .img_url
                .clone()
                .filter(|u| u.starts_with("http")),
        };
        if let Err(e) = self.store.upsert_contact(company_id, &patch).await {
            warn!("contact upsert for {id} failed: {e}");
            return false;
        }

        if let (Some(phone), Some(name)) = (phone.as_deref(), name.as_deref()) {
            if own_phone != Some(phone) && jid::is_meaningful_name(name, Some(phone)) {
                if let Err(e) = self.store.ensure_lead(company_id, phone, Some(name)).await {
                    warn!("lead for contact {phone} failed: {e}");
                }
            }
        }
        true
    }

    pub fn on_presence(&self, company_id: &str, session_id: &str, update: PresenceUpdate) {
        self.presence.submit(company_id, session_id, update);
    }

    pub async fn on_identity_mapping(&self, company_id: &str, alias: &str, phone: &str) {
        let alias = jid::normalize(alias);
        let phone = jid::normalize(phone);
        if let Err(e) = self.store.put_identity(company_id, &alias, &phone).await {
            warn!("identity mapping {alias} -> {phone} failed: {e}");
        }
    }
}

/// Coalesces presence updates per (session, contact): the first update opens
/// a window, later ones overwrite it, and only the latest is written when the
/// window closes.
#[derive(Clone)]
pub struct PresenceDebouncer {
    store: Store,
    window: Duration,
    pending: Arc<Mutex<HashMap<(String, String), (String, PresenceUpdate)>>>,
}

impl PresenceDebouncer {
    pub fn new(store: Store, window: Duration) -> Self {
        Self {
            store,
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn submit(&self, company_id: &str, session_id: &str, update: PresenceUpdate) {
        let key = (session_id.to_string(), jid::normalize(&update.jid));
        let opened = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .insert(key.clone(), (company_id.to_string(), update))
                .is_none()
        };
        if !opened {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.window).await;
            let latest = this
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            if let Some((company_id, update)) = latest {
                this.write(&company_id, &key.1, &update).await;
            }
        });
    }

    async fn write(&self, company_id: &str, contact_jid: &str, update: &PresenceUpdate) {
        let mut target = contact_jid.to_string();
        if jid::is_lid(&target) {
            if let Ok(Some(phone_jid)) = self.store.resolve_alias(company_id, &target).await {
                target = phone_jid;
            }
        }
        let last_seen = update.last_seen.map(|t| t.timestamp());
        if let Err(e) = self
            .store
            .set_presence(company_id, &target, update.kind.is_online(), last_seen)
            .await
        {
            warn!("presence for {target} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_store;
    use chrono::Utc;
    use wagate_core::event::{MessageKey, PresenceKind};
    use wagate_core::message::{MessageRecord, MessageStatus, MessageType};

    async fn seed_message(store: &Store, id: &str, message_type: MessageType) {
        store
            .upsert_message(&MessageRecord {
                company_id: "t1".into(),
                session_id: "s1".into(),
                remote_jid: "5511999999999@s.whatsapp.net".into(),
                whatsapp_id: id.into(),
                from_me: true,
                participant: None,
                content: "hi".into(),
                message_type,
                media_url: None,
                status: MessageStatus::Sent,
                structured: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn receipt(ids: &[&str], status: MessageStatus, from_self: bool) -> ReceiptUpdate {
        ReceiptUpdate {
            remote_jid: "5511999999999@s.whatsapp.net".into(),
            message_ids: ids.iter().map(|s| s.to_string()).collect(),
            status,
            from_self,
        }
    }

    fn target(id: &str) -> MessageKey {
        MessageKey {
            remote_jid: "5511999999999@s.whatsapp.net".into(),
            id: id.into(),
            from_me: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_receipts_never_regress_and_skip_self_echo() {
        let store = test_store().await;
        seed_message(&store, "M1", MessageType::Text).await;
        let handlers = EventHandlers::new(store.clone(), Duration::from_millis(10));

        handlers
            .on_receipts("t1", &[receipt(&["M1"], MessageStatus::Read, false)])
            .await;
        let changed = handlers
            .on_receipts("t1", &[receipt(&["M1"], MessageStatus::Delivered, false)])
            .await;
        assert_eq!(changed, 0);
        let msg = store.get_message("t1", "M1").await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Read);

        seed_message(&store, "M2", MessageType::Text).await;
        let changed = handlers
            .on_receipts("t1", &[receipt(&["M2"], MessageStatus::Read, true)])
            .await;
        assert_eq!(changed, 0);
    }

    #[tokio::test]
    async fn test_reactions_and_votes_update_lists() {
        let store = test_store().await;
        seed_message(&store, "M1", MessageType::Text).await;
        seed_message(&store, "P1", MessageType::Poll).await;
        let handlers = EventHandlers::new(store.clone(), Duration::from_millis(10));

        let react = |emoji: &str| ReactionUpdate {
            target: target("M1"),
            actor: "5511777777777:4@s.whatsapp.net".into(),
            emoji: emoji.into(),
        };
        handlers.on_reactions("t1", &[react("👍"), react("🔥")]).await;
        let msg = store.get_message("t1", "M1").await.unwrap().unwrap();
        assert_eq!(msg.reactions.len(), 1);
        assert_eq!(msg.reactions[0].emoji, "🔥");
        assert_eq!(msg.reactions[0].actor, "5511777777777@s.whatsapp.net");

        handlers.on_reactions("t1", &[react("")]).await;
        let msg = store.get_message("t1", "M1").await.unwrap().unwrap();
        assert!(msg.reactions.is_empty());

        let vote = |options: &[&str]| PollVoteUpdate {
            target: target("P1"),
            voter: "5511777777777@s.whatsapp.net".into(),
            options: options.iter().map(|s| s.to_string()).collect(),
        };
        handlers.on_poll_votes("t1", &[vote(&["Yes"]), vote(&["No"])]).await;
        let poll = store.get_message("t1", "P1").await.unwrap().unwrap();
        assert_eq!(poll.poll_votes.len(), 1);
        assert_eq!(poll.poll_votes[0].options, vec!["No".to_string()]);
    }

    #[tokio::test]
    async fn test_reaction_on_alias_chat_lands_on_phone_chat() {
        let store = test_store().await;
        seed_message(&store, "M1", MessageType::Text).await;
        store
            .put_identity("t1", "999@lid", "5511999999999@s.whatsapp.net")
            .await
            .unwrap();
        let handlers = EventHandlers::new(store.clone(), Duration::from_millis(10));

        let reaction = ReactionUpdate {
            target: MessageKey {
                remote_jid: "999@lid".into(),
                id: "M1".into(),
                ..Default::default()
            },
            actor: "999@lid".into(),
            emoji: "👍".into(),
        };
        handlers.on_reactions("t1", &[reaction]).await;
        let msg = store.get_message("t1", "M1").await.unwrap().unwrap();
        assert_eq!(msg.reactions.len(), 1);
    }

    #[tokio::test]
    async fn test_contact_sync_names_leads_and_aliases() {
        let store = test_store().await;
        let handlers = EventHandlers::new(store.clone(), Duration::from_millis(10));

        let contacts = vec![
            RawContact {
                id: "5511922223333@s.whatsapp.net".into(),
                lid: Some("4242@lid".into()),
                name: Some("Carla Souza".into()),
                notify: Some("carlinha".into()),
                ..Default::default()
            },
            RawContact {
                id: "5511944445555@s.whatsapp.net".into(),
                name: Some("5511944445555".into()),
                ..Default::default()
            },
            RawContact {
                id: "120363001234567890@g.us".into(),
                name: Some("Grupo".into()),
                ..Default::default()
            },
        ];
        let written = handlers.on_contacts("t1", &contacts, None).await;
        assert_eq!(written, 2);

        let carla = store
            .get_contact("t1", "5511922223333@s.whatsapp.net")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(carla.name.as_deref(), Some("Carla Souza"));
        assert_eq!(carla.push_name.as_deref(), Some("carlinha"));
        assert_eq!(
            store.resolve_alias("t1", "4242@lid").await.unwrap().as_deref(),
            Some("5511922223333@s.whatsapp.net")
        );

        assert!(store.get_lead("t1", "5511922223333").await.unwrap().is_some());
        // A phone-shaped name is not a real name: no lead.
        assert!(store.get_lead("t1", "5511944445555").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_presence_debounce_writes_latest_once() {
        let store = test_store().await;
        let handlers = EventHandlers::new(store.clone(), Duration::from_millis(50));
        let jid = "5511966667777@s.whatsapp.net";

        for kind in [PresenceKind::Available, PresenceKind::Composing, PresenceKind::Unavailable] {
            handlers.on_presence(
                "t1",
                "s1",
                PresenceUpdate {
                    jid: jid.into(),
                    kind,
                    last_seen: None,
                },
            );
        }
        assert!(store.get_contact("t1", jid).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let contact = store.get_contact("t1", jid).await.unwrap().unwrap();
        assert!(!contact.is_online);
    }
}
