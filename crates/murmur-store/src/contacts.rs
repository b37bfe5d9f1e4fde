use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use murmur_shared::identity::PeerIdentity;
use murmur_shared::models::Contact;
use murmur_shared::types::UserId;

use crate::database::{conversion_error, Database};
use crate::error::{Result, StoreError};

impl Database {
    /// Insert or replace a contact. The stored id must be the hash of the
    /// stored public key.
    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        contact
            .identity
            .verify()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        self.conn().execute(
            "INSERT INTO contacts (user_id, public_key, signing_public_key, username, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                signing_public_key = excluded.signing_public_key,
                username = excluded.username",
            params![
                contact.identity.id.to_hex(),
                hex::encode(contact.identity.public_key),
                contact.identity.signing_public_key.map(hex::encode),
                contact.identity.username,
                contact.added_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_contact(&self, id: &UserId) -> Result<Option<Contact>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT user_id, public_key, signing_public_key, username, added_at
                 FROM contacts WHERE user_id = ?1",
                params![id.to_hex()],
                row_to_contact,
            )
            .optional()?)
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, public_key, signing_public_key, username, added_at
             FROM contacts ORDER BY username",
        )?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    pub fn delete_contact(&self, id: &UserId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM contacts WHERE user_id = ?1", params![id.to_hex()])?;
        Ok(affected > 0)
    }
}

pub(crate) fn decode_key(column: usize, hex_key: &str) -> rusqlite::Result<[u8; 32]> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(hex_key, &mut key).map_err(|e| conversion_error(column, e))?;
    Ok(key)
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let id_hex: String = row.get(0)?;
    let public_hex: String = row.get(1)?;
    let signing_hex: Option<String> = row.get(2)?;
    let username: String = row.get(3)?;
    let added_str: String = row.get(4)?;

    let id = UserId::from_hex(&id_hex).map_err(|e| conversion_error(0, e))?;
    let public_key = decode_key(1, &public_hex)?;
    let signing_public_key = signing_hex.as_deref().map(|s| decode_key(2, s)).transpose()?;
    let added_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&added_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(4, e))?;

    let identity = PeerIdentity::from_claimed(id, public_key, signing_public_key, username)
        .map_err(|e| conversion_error(1, e))?;

    Ok(Contact { identity, added_at })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::unlocked_db;
    use murmur_shared::identity::KeyMaterial;

    #[test]
    fn contact_round_trip() {
        let db = unlocked_db();
        let contact = Contact::new(KeyMaterial::generate().to_identity("bob"));

        db.upsert_contact(&contact).unwrap();
        let loaded = db.get_contact(contact.id()).unwrap().unwrap();

        assert_eq!(loaded.identity, contact.identity);
        assert_eq!(loaded.added_at.timestamp(), contact.added_at.timestamp());
    }

    #[test]
    fn upsert_updates_username() {
        let db = unlocked_db();
        let mut contact = Contact::new(KeyMaterial::generate().to_identity("bob"));
        db.upsert_contact(&contact).unwrap();

        contact.identity.username = "robert".into();
        db.upsert_contact(&contact).unwrap();

        let all = db.list_contacts().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].identity.username, "robert");
    }

    #[test]
    fn missing_contact_is_none() {
        let db = unlocked_db();
        assert!(db.get_contact(&UserId([1; 32])).unwrap().is_none());
        assert!(!db.delete_contact(&UserId([1; 32])).unwrap());
    }

    #[test]
    fn inconsistent_identity_rejected() {
        let db = unlocked_db();
        let mut contact = Contact::new(KeyMaterial::generate().to_identity("eve"));
        contact.identity.id = UserId([2; 32]);
        assert!(matches!(db.upsert_contact(&contact), Err(StoreError::Corrupt(_))));
    }
}
