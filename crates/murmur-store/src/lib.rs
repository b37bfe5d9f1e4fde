//! # murmur-store
//!
//! Local storage for Murmur, backed by SQLite.
//!
//! Message bodies and group keys are sealed under a key derived from the
//! database password, and the identity's private keys are wrapped with the
//! same password. The crate exposes a synchronous [`Database`] handle with
//! typed helpers per table, the async [`SqliteStore`] and [`MemoryStore`]
//! implementations of `Persistence`, and [`SqliteMailbox`] for the polling
//! delivery channel.

pub mod contacts;
pub mod database;
pub mod groups;
pub mod keys;
pub mod mailbox;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod sqlite_store;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use mailbox::SqliteMailbox;
pub use memory::MemoryStore;
pub use sqlite_store::SqliteStore;
