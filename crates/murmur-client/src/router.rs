//! Message routing between the transport and the local store.
//!
//! Inbound envelopes are checked, decrypted, persisted and handed to
//! subscribers. Outbound messages are encrypted, signed, persisted locally
//! and then handed to the transport.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use murmur_net::{PeerEvent, TransportCoordinator};
use murmur_shared::crypto::{
    decrypt_direct, decrypt_group, encrypt_direct, encrypt_group, generate_symmetric_key,
};
use murmur_shared::protocol::{Envelope, EnvelopeKind, MessagePayload, MessageType};
use murmur_shared::{
    now_millis, ChatId, Contact, Group, GroupId, KeyMaterial, Message, PeerIdentity, Persistence,
    UserId,
};

use crate::config::RouterPolicy;
use crate::error::{Rejection, Result, RoutingError};
use crate::events::{Subscribers, SubscriptionHandle};

pub struct MessageRouter {
    identity: PeerIdentity,
    keys: KeyMaterial,
    store: Arc<dyn Persistence>,
    transport: TransportCoordinator,
    policy: RouterPolicy,
    message_subscribers: Subscribers<Message>,
    peer_subscribers: Subscribers<PeerEvent>,
}

impl MessageRouter {
    pub fn new(
        identity: PeerIdentity,
        keys: KeyMaterial,
        store: Arc<dyn Persistence>,
        transport: TransportCoordinator,
        policy: RouterPolicy,
    ) -> Self {
        Self {
            identity,
            keys,
            store,
            transport,
            policy,
            message_subscribers: Subscribers::new("message"),
            peer_subscribers: Subscribers::new("peer-status"),
        }
    }

    /// Build a router from the identity and key material already saved in
    /// `store`. Fails with `KeysMissing` when either is absent or they do not
    /// belong together.
    pub async fn load(
        store: Arc<dyn Persistence>,
        transport: TransportCoordinator,
        policy: RouterPolicy,
    ) -> Result<Self> {
        let keys = store
            .get_key_pair()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read key material");
                None
            })
            .ok_or(RoutingError::KeysMissing)?;
        let identity = store
            .get_current_user()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read current user");
                None
            })
            .ok_or(RoutingError::KeysMissing)?;

        if identity.id != keys.user_id() {
            warn!(user = %identity.id.short(), "Stored identity does not match stored keys");
            return Err(RoutingError::KeysMissing);
        }

        Ok(Self::new(identity, keys, store, transport, policy))
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &TransportCoordinator {
        &self.transport
    }

    // -----------------------------------------------------------------------
    // Subscribers
    // -----------------------------------------------------------------------

    pub fn on_message<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.message_subscribers.subscribe(handler)
    }

    pub fn on_peer_status<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.peer_subscribers.subscribe(handler)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.message_subscribers.unsubscribe(handle) || self.peer_subscribers.unsubscribe(handle)
    }

    pub fn notify_peer_status(&self, event: &PeerEvent) {
        self.peer_subscribers.emit(event);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Drain the transport's inbound queue until it closes. A rejected
    /// envelope never stops the loop.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            let id = envelope.id();
            match self.handle_envelope(&envelope).await {
                Ok(message) => debug!(
                    id = %id.short(),
                    sender = %message.sender_id.short(),
                    "Message accepted"
                ),
                Err(Rejection::OwnEcho) => trace!(id = %id.short(), "Dropped own echo"),
                Err(reason) => warn!(
                    id = %id.short(),
                    sender = %envelope.sender_id().short(),
                    reason = %reason,
                    "Dropped inbound envelope"
                ),
            }
        }
        debug!("Inbound queue closed");
    }

    /// Forward transport peer events to `on_peer_status` subscribers.
    pub async fn run_peer_events(self: Arc<Self>, mut events: broadcast::Receiver<PeerEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.notify_peer_status(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Peer event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Check, decrypt, persist and publish one inbound envelope.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> std::result::Result<Message, Rejection> {
        let sender = *envelope.sender_id();
        if sender == self.identity.id {
            return Err(Rejection::OwnEcho);
        }

        let plaintext = match envelope.kind() {
            EnvelopeKind::DirectMessage => {
                if envelope.recipient_id() != Some(&self.identity.id) {
                    return Err(Rejection::Misaddressed);
                }
                let contact = self
                    .lookup_contact(&sender)
                    .await
                    .ok_or(Rejection::UnknownSender(sender))?;
                self.check_signature(envelope, contact.identity.signing_public_key.as_ref())?;
                decrypt_direct(
                    envelope.content(),
                    &contact.identity.public_key,
                    self.keys.encryption().private_key(),
                )
                .map_err(Rejection::Decryption)?
            }
            EnvelopeKind::GroupMessage => {
                let group_id = *envelope.group_id().ok_or(Rejection::Misaddressed)?;
                let group = self
                    .lookup_group(&group_id)
                    .await
                    .ok_or(Rejection::UnknownGroup(group_id))?;
                if !group.members.is_empty() && !group.members.contains(&sender) {
                    return Err(Rejection::NotAMember(sender));
                }
                let signing_key = self
                    .lookup_contact(&sender)
                    .await
                    .and_then(|contact| contact.identity.signing_public_key);
                self.check_signature(envelope, signing_key.as_ref())?;
                decrypt_group(envelope.content(), &group.symmetric_key)
                    .map_err(Rejection::Decryption)?
            }
            EnvelopeKind::PresenceAnnouncement => return Err(Rejection::NotAMessage),
        };

        let now = now_millis();
        if self.policy.enforce_freshness {
            let skew_ms = now - envelope.timestamp();
            let window_ms = i64::try_from(self.policy.freshness_window.as_millis()).unwrap_or(i64::MAX);
            if skew_ms.abs() > window_ms {
                return Err(Rejection::Stale { skew_ms });
            }
        }

        let payload = MessagePayload::from_bytes(&plaintext)
            .map_err(|e| Rejection::MalformedPayload(e.to_string()))?;
        let message = build_message(envelope, payload, now);

        if let Err(e) = self.store.save_message(&message).await {
            error!(id = %message.id.short(), error = %e, "Failed to persist inbound message");
        }
        self.message_subscribers.emit(&message);
        Ok(message)
    }

    /// Accept an envelope that arrived outside the transport, e.g. copied
    /// from another device, in its JSON wire form.
    pub async fn import_envelope_json(&self, json: &str) -> Result<Message> {
        let envelope = Envelope::from_json(json)?;
        Ok(self.handle_envelope(&envelope).await?)
    }

    fn check_signature(
        &self,
        envelope: &Envelope,
        signing_key: Option<&[u8; 32]>,
    ) -> std::result::Result<(), Rejection> {
        match (envelope.signature(), signing_key) {
            (Some(_), Some(key)) if envelope.verify_signature(key) => Ok(()),
            (Some(_), Some(_)) => Err(Rejection::BadSignature),
            // Signed by a sender whose signing key we do not hold.
            (Some(_), None) if self.policy.require_signatures => Err(Rejection::BadSignature),
            (Some(_), None) => Ok(()),
            (None, _) if self.policy.require_signatures => Err(Rejection::MissingSignature),
            (None, _) => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    pub async fn send_direct_message(&self, recipient: &UserId, text: &str) -> Result<Message> {
        self.send_direct(recipient, text, None).await
    }

    /// The expiry travels inside the ciphertext; both sides purge the
    /// message once it passes.
    pub async fn send_ephemeral_direct_message(
        &self,
        recipient: &UserId,
        text: &str,
        ttl: Duration,
    ) -> Result<Message> {
        self.send_direct(recipient, text, Some(ttl)).await
    }

    pub async fn send_group_message(&self, group_id: &GroupId, text: &str) -> Result<Message> {
        self.send_group(group_id, text, None).await
    }

    pub async fn send_ephemeral_group_message(
        &self,
        group_id: &GroupId,
        text: &str,
        ttl: Duration,
    ) -> Result<Message> {
        self.send_group(group_id, text, Some(ttl)).await
    }

    async fn send_direct(&self, recipient: &UserId, text: &str, ttl: Option<Duration>) -> Result<Message> {
        let contact = self
            .lookup_contact(recipient)
            .await
            .ok_or(RoutingError::UnknownContact(*recipient))?;

        let now = now_millis();
        let payload = text_payload(text, now, ttl);
        let sealed = encrypt_direct(
            &payload.to_bytes()?,
            &contact.identity.public_key,
            self.keys.encryption().private_key(),
        )?;

        let envelope = self.sign(Envelope::direct(self.identity.id, *recipient, sealed, now));
        self.deliver(envelope, payload, now).await
    }

    async fn send_group(&self, group_id: &GroupId, text: &str, ttl: Option<Duration>) -> Result<Message> {
        let group = self
            .lookup_group(group_id)
            .await
            .ok_or(RoutingError::UnknownGroup(*group_id))?;

        let now = now_millis();
        let payload = text_payload(text, now, ttl);
        let sealed = encrypt_group(&payload.to_bytes()?, &group.symmetric_key)?;

        let envelope = self.sign(Envelope::group(self.identity.id, *group_id, sealed, now));
        self.deliver(envelope, payload, now).await
    }

    fn sign(&self, envelope: Envelope) -> Envelope {
        match self.keys.signing() {
            Some(signer) => envelope.signed(signer),
            None => envelope,
        }
    }

    // Persist first; a transport failure after that is only logged.
    async fn deliver(&self, envelope: Envelope, payload: MessagePayload, now: i64) -> Result<Message> {
        let message = build_message(&envelope, payload, now);
        self.store.save_message(&message).await?;

        match self.transport.send(&envelope).await {
            Ok(accepted) => debug!(id = %message.id.short(), channels = accepted, "Envelope sent"),
            Err(e) => warn!(
                id = %message.id.short(),
                error = %e,
                "Transport failed; message kept locally"
            ),
        }
        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Contacts, groups and history
    // -----------------------------------------------------------------------

    pub async fn add_contact(&self, identity: PeerIdentity) -> Result<Contact> {
        identity.verify()?;
        let contact = Contact::new(identity);
        self.store.save_contact(&contact).await?;
        info!(peer = %contact.id().short(), "Contact added");
        Ok(contact)
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.store.get_all_contacts().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read contacts");
            Vec::new()
        })
    }

    /// Create a group with a fresh key. The local user is always a member.
    pub async fn create_group(
        &self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = UserId>,
    ) -> Result<Group> {
        let mut members: BTreeSet<UserId> = members.into_iter().collect();
        members.insert(self.identity.id);

        let group = Group {
            id: GroupId::new(),
            name: name.into(),
            symmetric_key: generate_symmetric_key(),
            members,
        };
        self.store.save_group(&group).await?;
        info!(group = %group.id, members = group.members.len(), "Group created");
        Ok(group)
    }

    /// Save a group whose key was shared with us out of band.
    pub async fn join_group(&self, group: &Group) -> Result<()> {
        self.store.save_group(group).await?;
        info!(group = %group.id, "Joined group");
        Ok(())
    }

    /// History of one conversation, oldest first, with `is_expired`
    /// recomputed against the current time.
    pub async fn messages_for_chat(&self, chat: &ChatId) -> Result<Vec<Message>> {
        let now = now_millis();
        let mut messages = self.store.get_messages_for_chat(chat).await?;
        for message in &mut messages {
            message.is_expired = message.is_expired_at(now);
        }
        Ok(messages)
    }

    /// Delete ephemeral messages whose expiry has passed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let purged = self.store.purge_expired_messages(now_millis()).await?;
        if purged > 0 {
            debug!(purged, "Purged expired messages");
        }
        Ok(purged)
    }

    async fn lookup_contact(&self, id: &UserId) -> Option<Contact> {
        self.store.get_contact(id).await.unwrap_or_else(|e| {
            warn!(peer = %id.short(), error = %e, "Contact lookup failed");
            None
        })
    }

    async fn lookup_group(&self, id: &GroupId) -> Option<Group> {
        self.store.get_group(id).await.unwrap_or_else(|e| {
            warn!(group = %id, error = %e, "Group lookup failed");
            None
        })
    }
}

fn text_payload(text: &str, now: i64, ttl: Option<Duration>) -> MessagePayload {
    MessagePayload {
        text: text.to_string(),
        message_type: MessageType::Text,
        expires_at: ttl.map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))),
    }
}

fn build_message(envelope: &Envelope, payload: MessagePayload, now: i64) -> Message {
    let mut message = Message {
        id: envelope.id(),
        sender_id: *envelope.sender_id(),
        recipient_id: envelope.recipient_id().copied(),
        group_id: envelope.group_id().copied(),
        plaintext: payload.text,
        timestamp: envelope.timestamp(),
        message_type: payload.message_type,
        is_ephemeral: payload.expires_at.is_some(),
        expires_at: payload.expires_at,
        is_expired: false,
    };
    message.is_expired = message.is_expired_at(now);
    message
}
