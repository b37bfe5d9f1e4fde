//! In-memory [`Persistence`], used by tests and ephemeral sessions.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use murmur_shared::error::StorageError;
use murmur_shared::identity::{KeyMaterial, PeerIdentity};
use murmur_shared::models::{Contact, Group, Message};
use murmur_shared::persistence::Persistence;
use murmur_shared::types::{ChatId, GroupId, MessageId, UserId};

#[derive(Default)]
struct State {
    current_user: Option<PeerIdentity>,
    keys: Option<KeyMaterial>,
    contacts: HashMap<UserId, Contact>,
    groups: HashMap<GroupId, Group>,
    messages: Vec<Message>,
    message_ids: HashMap<MessageId, usize>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get_current_user(&self) -> Result<Option<PeerIdentity>, StorageError> {
        Ok(self.state.read().await.current_user.clone())
    }

    async fn save_current_user(&self, identity: &PeerIdentity) -> Result<(), StorageError> {
        self.state.write().await.current_user = Some(identity.clone());
        Ok(())
    }

    async fn save_key_pair(&self, keys: &KeyMaterial) -> Result<(), StorageError> {
        self.state.write().await.keys = Some(keys.clone());
        Ok(())
    }

    async fn get_key_pair(&self) -> Result<Option<KeyMaterial>, StorageError> {
        Ok(self.state.read().await.keys.clone())
    }

    async fn get_contact(&self, id: &UserId) -> Result<Option<Contact>, StorageError> {
        Ok(self.state.read().await.contacts.get(id).cloned())
    }

    async fn get_all_contacts(&self) -> Result<Vec<Contact>, StorageError> {
        let mut contacts: Vec<Contact> =
            self.state.read().await.contacts.values().cloned().collect();
        contacts.sort_by(|a, b| a.identity.username.cmp(&b.identity.username));
        Ok(contacts)
    }

    async fn save_contact(&self, contact: &Contact) -> Result<(), StorageError> {
        contact
            .identity
            .verify()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        self.state
            .write()
            .await
            .contacts
            .insert(contact.identity.id, contact.clone());
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        if state.message_ids.contains_key(&message.id) {
            return Ok(());
        }
        let index = state.messages.len();
        state.message_ids.insert(message.id, index);
        state.messages.push(message.clone());
        Ok(())
    }

    async fn get_messages_for_chat(&self, chat: &ChatId) -> Result<Vec<Message>, StorageError> {
        let mut messages: Vec<Message> = self
            .state
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.belongs_to(chat))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn get_group(&self, id: &GroupId) -> Result<Option<Group>, StorageError> {
        Ok(self.state.read().await.groups.get(id).cloned())
    }

    async fn save_group(&self, group: &Group) -> Result<(), StorageError> {
        self.state
            .write()
            .await
            .groups
            .insert(group.id, group.clone());
        Ok(())
    }

    async fn purge_expired_messages(&self, now: i64) -> Result<usize, StorageError> {
        let mut state = self.state.write().await;
        let before = state.messages.len();
        state
            .messages
            .retain(|m| !m.expires_at.is_some_and(|expires_at| expires_at < now));
        let removed = before - state.messages.len();
        if removed > 0 {
            let ids: HashMap<MessageId, usize> = state
                .messages
                .iter()
                .enumerate()
                .map(|(index, m)| (m.id, index))
                .collect();
            state.message_ids = ids;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::protocol::MessageType;
    use murmur_shared::types::EnvelopeId;

    fn message(id: u8, timestamp: i64, expires_at: Option<i64>) -> Message {
        Message {
            id: EnvelopeId([id; 32]),
            sender_id: UserId([1; 32]),
            recipient_id: Some(UserId([2; 32])),
            group_id: None,
            plaintext: "x".into(),
            timestamp,
            message_type: MessageType::Text,
            is_ephemeral: expires_at.is_some(),
            expires_at,
            is_expired: false,
        }
    }

    #[tokio::test]
    async fn messages_are_deduplicated_and_ordered() {
        let store = MemoryStore::new();
        store.save_message(&message(1, 30, None)).await.unwrap();
        store.save_message(&message(2, 10, None)).await.unwrap();
        store.save_message(&message(1, 30, None)).await.unwrap();

        let chat = store
            .get_messages_for_chat(&ChatId::Direct(UserId([2; 32])))
            .await
            .unwrap();
        assert_eq!(chat.iter().map(|m| m.timestamp).collect::<Vec<_>>(), vec![10, 30]);
    }

    #[tokio::test]
    async fn purge_then_resave_works() {
        let store = MemoryStore::new();
        store.save_message(&message(1, 1, Some(50))).await.unwrap();
        store.save_message(&message(2, 2, None)).await.unwrap();

        assert_eq!(store.purge_expired_messages(100).await.unwrap(), 1);
        assert_eq!(store.message_count().await, 1);

        store.save_message(&message(2, 2, None)).await.unwrap();
        assert_eq!(store.message_count().await, 1);
    }
}
