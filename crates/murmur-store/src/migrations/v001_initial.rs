//! v001 -- Initial schema creation.
//!
//! Sealed columns hold `nonce || ciphertext` under the store key derived
//! from the database password (see `store_meta`).

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Store metadata (single row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS store_meta (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    salt        BLOB NOT NULL,
    ops_cost    INTEGER NOT NULL,
    mem_cost    INTEGER NOT NULL,
    parallelism INTEGER NOT NULL,
    verifier    BLOB NOT NULL                 -- sealed known constant
);

-- ----------------------------------------------------------------
-- Local identity (single row each)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS local_user (
    id                 INTEGER PRIMARY KEY CHECK (id = 1),
    user_id            TEXT NOT NULL,          -- hex BLAKE3 of public_key
    public_key         TEXT NOT NULL,          -- hex X25519
    signing_public_key TEXT,                   -- hex Ed25519
    username           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS key_material (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    wrapped     BLOB NOT NULL,                 -- Argon2id-wrapped private keys
    salt        BLOB NOT NULL,
    ops_cost    INTEGER NOT NULL,
    mem_cost    INTEGER NOT NULL,
    parallelism INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    user_id            TEXT PRIMARY KEY NOT NULL,
    public_key         TEXT NOT NULL,
    signing_public_key TEXT,
    username           TEXT NOT NULL,
    added_at           TEXT NOT NULL           -- RFC-3339
);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    id            TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name          TEXT NOT NULL,
    sealed_key    BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL,
    user_id  TEXT NOT NULL,
    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,    -- hex envelope id
    sender_id    TEXT NOT NULL,
    recipient_id TEXT,
    group_id     TEXT,
    sealed_body  BLOB NOT NULL,
    timestamp    INTEGER NOT NULL,             -- Unix epoch millis
    message_type TEXT NOT NULL,
    is_ephemeral INTEGER NOT NULL DEFAULT 0,
    expires_at   INTEGER,
    is_expired   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_group_ts ON messages(group_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_sender_ts ON messages(sender_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_recipient_ts ON messages(recipient_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages(expires_at)
    WHERE expires_at IS NOT NULL;

-- ----------------------------------------------------------------
-- Shared mailbox for the polling channel
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS mailbox (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    posted_at     INTEGER NOT NULL,
    envelope_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mailbox_posted_at ON mailbox(posted_at);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
