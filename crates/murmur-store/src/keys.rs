//! The local user's identity and wrapped private keys. Both tables hold a
//! single row.

use rusqlite::{params, OptionalExtension};

use murmur_shared::constants::SALT_SIZE;
use murmur_shared::identity::PeerIdentity;
use murmur_shared::kdf::{KdfParams, WrappedKey};
use murmur_shared::types::UserId;

use crate::contacts::decode_key;
use crate::database::{conversion_error, Database};
use crate::error::Result;

impl Database {
    pub fn save_local_user(&self, identity: &PeerIdentity) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO local_user (id, user_id, public_key, signing_public_key, username)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                identity.id.to_hex(),
                hex::encode(identity.public_key),
                identity.signing_public_key.map(hex::encode),
                identity.username,
            ],
        )?;
        Ok(())
    }

    pub fn load_local_user(&self) -> Result<Option<PeerIdentity>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT user_id, public_key, signing_public_key, username FROM local_user WHERE id = 1",
                [],
                |row| {
                    let id_hex: String = row.get(0)?;
                    let public_hex: String = row.get(1)?;
                    let signing_hex: Option<String> = row.get(2)?;
                    let username: String = row.get(3)?;

                    let id = UserId::from_hex(&id_hex).map_err(|e| conversion_error(0, e))?;
                    let public_key = decode_key(1, &public_hex)?;
                    let signing = signing_hex.as_deref().map(|s| decode_key(2, s)).transpose()?;
                    PeerIdentity::from_claimed(id, public_key, signing, username)
                        .map_err(|e| conversion_error(1, e))
                },
            )
            .optional()?)
    }

    pub fn save_wrapped_key(&self, wrapped: &WrappedKey) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO key_material (id, wrapped, salt, ops_cost, mem_cost, parallelism)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                wrapped.wrapped,
                wrapped.salt.to_vec(),
                wrapped.params.ops_cost,
                wrapped.params.mem_cost,
                wrapped.params.parallelism,
            ],
        )?;
        Ok(())
    }

    pub fn load_wrapped_key(&self) -> Result<Option<WrappedKey>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT wrapped, salt, ops_cost, mem_cost, parallelism FROM key_material WHERE id = 1",
                [],
                |row| {
                    let salt_bytes: Vec<u8> = row.get(1)?;
                    let salt: [u8; SALT_SIZE] = salt_bytes.as_slice().try_into().map_err(|_| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Blob,
                            format!("salt must be {SALT_SIZE} bytes").into(),
                        )
                    })?;
                    Ok(WrappedKey {
                        wrapped: row.get(0)?,
                        salt,
                        params: KdfParams {
                            ops_cost: row.get(2)?,
                            mem_cost: row.get(3)?,
                            parallelism: row.get(4)?,
                        },
                    })
                },
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{test_params, unlocked_db};
    use murmur_shared::identity::KeyMaterial;

    #[test]
    fn local_user_round_trip() {
        let db = unlocked_db();
        assert!(db.load_local_user().unwrap().is_none());

        let identity = KeyMaterial::generate().to_identity("alice");
        db.save_local_user(&identity).unwrap();
        assert_eq!(db.load_local_user().unwrap(), Some(identity));
    }

    #[test]
    fn wrapped_key_round_trip() {
        let db = unlocked_db();
        let keys = KeyMaterial::generate();
        let wrapped = keys.wrap(b"pw", &test_params()).unwrap();

        db.save_wrapped_key(&wrapped).unwrap();
        let loaded = db.load_wrapped_key().unwrap().unwrap();
        assert_eq!(loaded, wrapped);

        let restored = KeyMaterial::unwrap(&loaded, b"pw").unwrap();
        assert_eq!(restored.user_id(), keys.user_id());
    }
}
