use rusqlite::params;

use murmur_shared::models::Message;
use murmur_shared::protocol::MessageType;
use murmur_shared::types::{ChatId, EnvelopeId, GroupId, UserId};

use crate::database::{conversion_error, Database};
use crate::error::{Result, StoreError};

const SELECT_COLUMNS: &str = "SELECT id, sender_id, recipient_id, group_id, sealed_body, timestamp,
        message_type, is_ephemeral, expires_at, is_expired
 FROM messages";

/// A row as stored, with the body still sealed.
struct StoredMessage {
    message: Message,
    sealed_body: Vec<u8>,
}

impl Database {
    /// Insert a message. Returns `false` when a message with the same id
    /// already exists, in which case nothing is written.
    pub fn insert_message(&self, message: &Message) -> Result<bool> {
        let sealed_body = self.seal(message.plaintext.as_bytes())?;
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                (id, sender_id, recipient_id, group_id, sealed_body, timestamp,
                 message_type, is_ephemeral, expires_at, is_expired)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id.to_hex(),
                message.sender_id.to_hex(),
                message.recipient_id.map(|id| id.to_hex()),
                message.group_id.map(|id| id.to_string()),
                sealed_body,
                message.timestamp,
                message_type_name(message.message_type),
                message.is_ephemeral,
                message.expires_at,
                message.is_expired,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Messages of one conversation, oldest first.
    pub fn get_messages_for_chat(&self, chat: &ChatId) -> Result<Vec<Message>> {
        let (sql, key) = match chat {
            ChatId::Group(group_id) => (
                format!("{SELECT_COLUMNS} WHERE group_id = ?1 ORDER BY timestamp ASC, id ASC"),
                group_id.to_string(),
            ),
            ChatId::Direct(peer) => (
                format!(
                    "{SELECT_COLUMNS} WHERE group_id IS NULL AND (sender_id = ?1 OR recipient_id = ?1)
                     ORDER BY timestamp ASC, id ASC"
                ),
                peer.to_hex(),
            ),
        };

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![key], row_to_stored)?;

        let mut messages = Vec::new();
        for row in rows {
            let stored = row?;
            let body = self.unseal(&stored.sealed_body)?;
            let plaintext = String::from_utf8(body)
                .map_err(|e| StoreError::Corrupt(format!("message body: {e}")))?;
            messages.push(Message {
                plaintext,
                ..stored.message
            });
        }
        Ok(messages)
    }

    /// Delete messages whose expiry lies before `now` (Unix epoch millis).
    pub fn purge_expired_messages(&self, now: i64) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        Ok(affected)
    }

    pub fn message_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn message_type_name(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Text => "text",
        MessageType::System => "system",
    }
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id_hex: String = row.get(0)?;
    let sender_hex: String = row.get(1)?;
    let recipient_hex: Option<String> = row.get(2)?;
    let group_str: Option<String> = row.get(3)?;
    let sealed_body: Vec<u8> = row.get(4)?;
    let type_str: String = row.get(6)?;

    let id = EnvelopeId::from_hex(&id_hex).map_err(|e| conversion_error(0, e))?;
    let sender_id = UserId::from_hex(&sender_hex).map_err(|e| conversion_error(1, e))?;
    let recipient_id = recipient_hex
        .as_deref()
        .map(|s| UserId::from_hex(s).map_err(|e| conversion_error(2, e)))
        .transpose()?;
    let group_id = group_str
        .as_deref()
        .map(|s| GroupId::parse(s).map_err(|e| conversion_error(3, e)))
        .transpose()?;
    let message_type = match type_str.as_str() {
        "system" => MessageType::System,
        _ => MessageType::Text,
    };

    Ok(StoredMessage {
        message: Message {
            id,
            sender_id,
            recipient_id,
            group_id,
            plaintext: String::new(),
            timestamp: row.get(5)?,
            message_type,
            is_ephemeral: row.get(7)?,
            expires_at: row.get(8)?,
            is_expired: row.get(9)?,
        },
        sealed_body,
    })
}
