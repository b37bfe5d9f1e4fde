use thiserror::Error;

use murmur_shared::error::{CryptoError, StorageError};

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite / SQLCipher error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Sealed columns were touched before [`Database::unlock`](crate::Database::unlock).
    #[error("Database is locked")]
    Locked,

    /// The password does not open this database.
    #[error("Wrong database password")]
    WrongPassword,

    /// Sealing, unsealing or key wrapping failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A stored value could not be decoded back into its domain type.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A blocking task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn into_read(self) -> StorageError {
        match self {
            StoreError::NotFound => StorageError::NotFound,
            other => StorageError::ReadFailed(other.to_string()),
        }
    }

    pub fn into_write(self) -> StorageError {
        match self {
            StoreError::NotFound => StorageError::NotFound,
            other => StorageError::WriteFailed(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
