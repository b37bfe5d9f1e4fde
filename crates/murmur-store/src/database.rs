//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.
//!
//! Plain SQLite is the default build. Sensitive columns (message bodies,
//! group keys) are sealed with XChaCha20-Poly1305 under a store key derived
//! from the database password, so they are only readable after
//! [`Database::unlock`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use zeroize::Zeroizing;

use murmur_shared::crypto::{decrypt_group, encrypt_group, SymmetricKey};
use murmur_shared::error::CryptoError;
use murmur_shared::kdf::{derive_key_from_password, generate_salt, KdfParams};

use crate::error::{Result, StoreError};
use crate::migrations;

const VERIFIER_PLAINTEXT: &[u8] = b"murmur-store-v1";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    store_key: Option<Zeroizing<SymmetricKey>>,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/murmur/murmur.db`
    /// - macOS:   `~/Library/Application Support/org.murmur.murmur/murmur.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\murmur\murmur\data\murmur.db`
    pub fn new() -> Result<Self> {
        let db_path = Self::default_path()?;
        tracing::info!(path = %db_path.display(), "opening database");
        Self::open_at(&db_path)
    }

    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("org", "murmur", "murmur").ok_or(StoreError::NoDataDir)?;
        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        Ok(data_dir.join("murmur.db"))
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // The mailbox file is shared between processes.
        conn.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run_migrations(&mut conn)?;

        Ok(Self {
            conn,
            store_key: None,
        })
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            conn,
            store_key: None,
        })
    }

    /// Derive the store key from `password`.
    ///
    /// The first unlock of a fresh database records the salt, cost
    /// parameters and a verifier; later unlocks reuse the recorded
    /// parameters and fail with [`StoreError::WrongPassword`] on mismatch.
    /// Runs Argon2id, so call it off the async runtime.
    pub fn unlock(&mut self, password: &[u8], params: &KdfParams) -> Result<()> {
        let existing = self
            .conn
            .query_row(
                "SELECT salt, ops_cost, mem_cost, parallelism, verifier FROM store_meta WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        KdfParams {
                            ops_cost: row.get(1)?,
                            mem_cost: row.get(2)?,
                            parallelism: row.get(3)?,
                        },
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;

        let key = match existing {
            Some((salt, stored_params, verifier)) => {
                let key = derive_key_from_password(password, &salt, &stored_params)?;
                match decrypt_group(&verifier, &key) {
                    Ok(plain) if plain == VERIFIER_PLAINTEXT => key,
                    Ok(_) | Err(CryptoError::AuthenticationFailed) => {
                        return Err(StoreError::WrongPassword)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => {
                let salt = generate_salt();
                let key = derive_key_from_password(password, &salt, params)?;
                let verifier = encrypt_group(VERIFIER_PLAINTEXT, &key)?;
                self.conn.execute(
                    "INSERT INTO store_meta (id, salt, ops_cost, mem_cost, parallelism, verifier)
                     VALUES (1, ?1, ?2, ?3, ?4, ?5)",
                    params![
                        salt.to_vec(),
                        params.ops_cost,
                        params.mem_cost,
                        params.parallelism,
                        verifier
                    ],
                )?;
                tracing::info!("initialized store key");
                key
            }
        };

        self.store_key = Some(key);
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.store_key.is_some()
    }

    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.store_key.as_ref().ok_or(StoreError::Locked)?;
        Ok(encrypt_group(plaintext, key)?)
    }

    pub(crate) fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let key = self.store_key.as_ref().ok_or(StoreError::Locked)?;
        Ok(decrypt_group(sealed, key)?)
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

/// Map a column decode failure into a rusqlite conversion error.
pub(crate) fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}
