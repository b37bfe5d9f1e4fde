//! SQLite-backed mailbox for the polling channel.
//!
//! Several processes on one device open the same file; WAL mode and the
//! busy timeout set in [`Database::open_at`] let them append and poll
//! concurrently.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::params;

use murmur_net::{MailboxEntry, MailboxStore, TransportError};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    pub fn mailbox_append(&self, posted_at: i64, envelope_json: &str) -> Result<u64> {
        self.conn().execute(
            "INSERT INTO mailbox (posted_at, envelope_json) VALUES (?1, ?2)",
            params![posted_at, envelope_json],
        )?;
        Ok(self.conn().last_insert_rowid() as u64)
    }

    pub fn mailbox_fetch_after(&self, cursor: u64, limit: usize) -> Result<Vec<MailboxEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT seq, posted_at, envelope_json FROM mailbox
             WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cursor as i64, limit as i64], |row| {
            Ok(MailboxEntry {
                seq: row.get::<_, i64>(0)? as u64,
                posted_at: row.get(1)?,
                envelope_json: row.get(2)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn mailbox_prune_before(&self, cutoff: i64) -> Result<usize> {
        Ok(self
            .conn()
            .execute("DELETE FROM mailbox WHERE posted_at < ?1", params![cutoff])?)
    }

    pub fn mailbox_last_seq_before(&self, cutoff: i64) -> Result<u64> {
        let seq: Option<i64> = self.conn().query_row(
            "SELECT MAX(seq) FROM mailbox WHERE posted_at < ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(seq.unwrap_or(0) as u64)
    }
}

#[derive(Clone)]
pub struct SqliteMailbox {
    db: Arc<Mutex<Database>>,
}

impl SqliteMailbox {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_at(path)?)),
        })
    }

    async fn with_db<T, F>(&self, f: F) -> std::result::Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(StoreError::from)
        .and_then(|result| result)
        .map_err(|e| TransportError::Mailbox(e.to_string()))
    }
}

#[async_trait]
impl MailboxStore for SqliteMailbox {
    async fn append(&self, posted_at: i64, envelope_json: String) -> std::result::Result<u64, TransportError> {
        self.with_db(move |db| db.mailbox_append(posted_at, &envelope_json))
            .await
    }

    async fn fetch_after(
        &self,
        cursor: u64,
        limit: usize,
    ) -> std::result::Result<Vec<MailboxEntry>, TransportError> {
        self.with_db(move |db| db.mailbox_fetch_after(cursor, limit))
            .await
    }

    async fn prune_before(&self, cutoff: i64) -> std::result::Result<usize, TransportError> {
        self.with_db(move |db| db.mailbox_prune_before(cutoff)).await
    }

    async fn last_seq_before(&self, cutoff: i64) -> std::result::Result<u64, TransportError> {
        self.with_db(move |db| db.mailbox_last_seq_before(cutoff))
            .await
    }
}
