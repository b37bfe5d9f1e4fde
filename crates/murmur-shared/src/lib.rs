//! Shared types, cryptography and wire protocol for Murmur.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod models;
pub mod persistence;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, EnvelopeError, IdentityError, MurmurError, StorageError};
pub use identity::{KeyMaterial, PeerIdentity};
pub use models::{Contact, Group, Message};
pub use persistence::Persistence;
pub use protocol::{Envelope, EnvelopeKind, MessagePayload, MessageType, PresencePayload};
pub use types::{now_millis, ChatId, EnvelopeId, GroupId, MessageId, UserId};
