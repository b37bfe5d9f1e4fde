//! [`Persistence`] over SQLite.
//!
//! All database work runs on the blocking pool behind a shared connection.
//! The private keys are wrapped with the store password before they touch
//! disk.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;
use zeroize::Zeroizing;

use murmur_shared::error::StorageError;
use murmur_shared::identity::{KeyMaterial, PeerIdentity};
use murmur_shared::kdf::KdfParams;
use murmur_shared::models::{Contact, Group, Message};
use murmur_shared::persistence::Persistence;
use murmur_shared::types::{ChatId, GroupId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
    password: Arc<Zeroizing<Vec<u8>>>,
    kdf_params: KdfParams,
}

impl SqliteStore {
    /// Open and unlock the database at `path`.
    pub async fn open(path: impl AsRef<Path>, password: &[u8], kdf_params: KdfParams) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let password = Arc::new(Zeroizing::new(password.to_vec()));
        let unlock_password = Arc::clone(&password);

        let db = tokio::task::spawn_blocking(move || -> Result<Database> {
            let mut db = Database::open_at(&path)?;
            db.unlock(&unlock_password, &kdf_params)?;
            Ok(db)
        })
        .await??;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            password,
            kdf_params,
        })
    }

    /// Open the database in the platform data directory.
    pub async fn open_default(password: &[u8], kdf_params: KdfParams) -> Result<Self> {
        let path = tokio::task::spawn_blocking(Database::default_path).await??;
        Self::open(path, password, kdf_params).await
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await?
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn get_current_user(&self) -> std::result::Result<Option<PeerIdentity>, StorageError> {
        self.with_db(|db| db.load_local_user())
            .await
            .map_err(StoreError::into_read)
    }

    async fn save_current_user(&self, identity: &PeerIdentity) -> std::result::Result<(), StorageError> {
        let identity = identity.clone();
        self.with_db(move |db| db.save_local_user(&identity))
            .await
            .map_err(StoreError::into_write)
    }

    async fn save_key_pair(&self, keys: &KeyMaterial) -> std::result::Result<(), StorageError> {
        let keys = keys.clone();
        let password = Arc::clone(&self.password);
        let params = self.kdf_params;
        self.with_db(move |db| {
            let wrapped = keys.wrap(&password, &params)?;
            db.save_wrapped_key(&wrapped)
        })
        .await
        .map_err(StoreError::into_write)
    }

    async fn get_key_pair(&self) -> std::result::Result<Option<KeyMaterial>, StorageError> {
        let password = Arc::clone(&self.password);
        self.with_db(move |db| {
            let Some(wrapped) = db.load_wrapped_key()? else {
                return Ok(None);
            };
            KeyMaterial::unwrap(&wrapped, &password)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("key material: {e}")))
        })
        .await
        .map_err(StoreError::into_read)
    }

    async fn get_contact(&self, id: &UserId) -> std::result::Result<Option<Contact>, StorageError> {
        let id = *id;
        self.with_db(move |db| db.get_contact(&id))
            .await
            .map_err(StoreError::into_read)
    }

    async fn get_all_contacts(&self) -> std::result::Result<Vec<Contact>, StorageError> {
        self.with_db(|db| db.list_contacts())
            .await
            .map_err(StoreError::into_read)
    }

    async fn save_contact(&self, contact: &Contact) -> std::result::Result<(), StorageError> {
        let contact = contact.clone();
        self.with_db(move |db| db.upsert_contact(&contact))
            .await
            .map_err(StoreError::into_write)
    }

    async fn save_message(&self, message: &Message) -> std::result::Result<(), StorageError> {
        let message = message.clone();
        self.with_db(move |db| {
            if !db.insert_message(&message)? {
                debug!(message = %message.id.short(), "Message already stored");
            }
            Ok(())
        })
        .await
        .map_err(StoreError::into_write)
    }

    async fn get_messages_for_chat(&self, chat: &ChatId) -> std::result::Result<Vec<Message>, StorageError> {
        let chat = *chat;
        self.with_db(move |db| db.get_messages_for_chat(&chat))
            .await
            .map_err(StoreError::into_read)
    }

    async fn get_group(&self, id: &GroupId) -> std::result::Result<Option<Group>, StorageError> {
        let id = *id;
        self.with_db(move |db| db.get_group(&id))
            .await
            .map_err(StoreError::into_read)
    }

    async fn save_group(&self, group: &Group) -> std::result::Result<(), StorageError> {
        let group = group.clone();
        self.with_db(move |db| db.upsert_group(&group))
            .await
            .map_err(StoreError::into_write)
    }

    async fn purge_expired_messages(&self, now: i64) -> std::result::Result<usize, StorageError> {
        self.with_db(move |db| db.purge_expired_messages(now))
            .await
            .map_err(StoreError::into_write)
    }
}
