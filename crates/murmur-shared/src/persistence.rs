//! The storage contract consumed by the router.
//!
//! Every operation is async and may fail. Reads that fail are treated by
//! callers as "not found"; writes propagate their error.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::identity::{KeyMaterial, PeerIdentity};
use crate::models::{Contact, Group, Message};
use crate::types::{ChatId, GroupId, UserId};

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_current_user(&self) -> Result<Option<PeerIdentity>, StorageError>;

    async fn save_current_user(&self, identity: &PeerIdentity) -> Result<(), StorageError>;

    async fn save_key_pair(&self, keys: &KeyMaterial) -> Result<(), StorageError>;

    async fn get_key_pair(&self) -> Result<Option<KeyMaterial>, StorageError>;

    async fn get_contact(&self, id: &UserId) -> Result<Option<Contact>, StorageError>;

    async fn get_all_contacts(&self) -> Result<Vec<Contact>, StorageError>;

    async fn save_contact(&self, contact: &Contact) -> Result<(), StorageError>;

    /// Saving a message whose id already exists is a no-op.
    async fn save_message(&self, message: &Message) -> Result<(), StorageError>;

    /// Messages of one conversation, oldest first.
    async fn get_messages_for_chat(&self, chat: &ChatId) -> Result<Vec<Message>, StorageError>;

    async fn get_group(&self, id: &GroupId) -> Result<Option<Group>, StorageError>;

    async fn save_group(&self, group: &Group) -> Result<(), StorageError>;

    /// Delete messages whose `expires_at` lies before `now`; returns how many.
    async fn purge_expired_messages(&self, now: i64) -> Result<usize, StorageError>;
}
