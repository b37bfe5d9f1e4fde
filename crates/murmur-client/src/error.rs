use thiserror::Error;

use murmur_net::TransportError;
use murmur_shared::{CryptoError, EnvelopeError, GroupId, IdentityError, StorageError, UserId};
use murmur_store::StoreError;

/// Failures surfaced to callers of the router's send and management
/// operations.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Unknown contact: {}", .0.short())]
    UnknownContact(UserId),

    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("No local key material")]
    KeysMissing,

    #[error("Envelope timestamp is {skew_ms} ms outside the freshness window")]
    StaleTimestamp { skew_ms: i64 },

    #[error("Envelope rejected: {0}")]
    Rejected(Rejection),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Why an inbound envelope was dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("own envelope echoed back")]
    OwnEcho,

    #[error("addressed to another user")]
    Misaddressed,

    #[error("presence is handled by the transport")]
    NotAMessage,

    #[error("sender {} is not a contact", .0.short())]
    UnknownSender(UserId),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("sender {} is not a member of the group", .0.short())]
    NotAMember(UserId),

    #[error("envelope is unsigned")]
    MissingSignature,

    #[error("signature does not verify")]
    BadSignature,

    #[error("decryption failed: {0}")]
    Decryption(CryptoError),

    #[error("timestamp is {skew_ms} ms away from local time")]
    Stale { skew_ms: i64 },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<Rejection> for RoutingError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::UnknownSender(id) => RoutingError::UnknownContact(id),
            Rejection::UnknownGroup(id) => RoutingError::UnknownGroup(id),
            Rejection::Stale { skew_ms } => RoutingError::StaleTimestamp { skew_ms },
            Rejection::Decryption(e) => RoutingError::Crypto(e),
            other => RoutingError::Rejected(other),
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        SessionError::Routing(RoutingError::Storage(e))
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;
