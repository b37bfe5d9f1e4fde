use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{derive_id, generate_key_pair, generate_signing_key_pair, KeyPair, SigningKeyPair};
use crate::error::{CryptoError, IdentityError, MurmurError};
use crate::kdf::{unwrap_private_key, wrap_private_key, KdfParams, WrappedKey};
use crate::types::UserId;

/// Public identity of a peer. The id is always the hash of the public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: UserId,
    pub public_key: [u8; 32],
    pub signing_public_key: Option<[u8; 32]>,
    pub username: String,
}

impl PeerIdentity {
    pub fn new(
        public_key: [u8; 32],
        signing_public_key: Option<[u8; 32]>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: derive_id(&public_key),
            public_key,
            signing_public_key,
            username: username.into(),
        }
    }

    /// Rebuild an identity received from elsewhere, rejecting it when the
    /// claimed id is not the hash of the claimed public key.
    pub fn from_claimed(
        id: UserId,
        public_key: [u8; 32],
        signing_public_key: Option<[u8; 32]>,
        username: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            id,
            public_key,
            signing_public_key,
            username: username.into(),
        };
        identity.verify()?;
        Ok(identity)
    }

    pub fn verify(&self) -> Result<(), IdentityError> {
        if derive_id(&self.public_key) == self.id {
            Ok(())
        } else {
            Err(IdentityError::IdMismatch)
        }
    }
}

/// The local user's private key material.
///
/// Never serialized in the clear; see [`KeyMaterial::wrap`].
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    encryption: KeyPair,
    signing: Option<SigningKeyPair>,
}

// encryption private (32) || flag (1) || signing private (32, when flag = 1)
const PACKED_LEN_WITHOUT_SIGNING: usize = 33;
const PACKED_LEN_WITH_SIGNING: usize = 65;

impl KeyMaterial {
    /// Generate fresh encryption and signing key pairs.
    pub fn generate() -> Self {
        Self {
            encryption: generate_key_pair(),
            signing: Some(generate_signing_key_pair()),
        }
    }

    pub fn new(encryption: KeyPair, signing: Option<SigningKeyPair>) -> Self {
        Self {
            encryption,
            signing,
        }
    }

    /// Import an X25519 private key. The public half is recomputed; when the
    /// caller also supplies one, it must match.
    pub fn import(
        private_key: [u8; 32],
        claimed_public: Option<[u8; 32]>,
        signing_private: Option<[u8; 32]>,
    ) -> Result<Self, IdentityError> {
        let encryption = KeyPair::from_private(private_key);
        if let Some(public) = claimed_public {
            if &public != encryption.public_key() {
                return Err(IdentityError::KeyMismatch);
            }
        }
        Ok(Self {
            encryption,
            signing: signing_private.map(SigningKeyPair::from_private),
        })
    }

    pub fn encryption(&self) -> &KeyPair {
        &self.encryption
    }

    pub fn signing(&self) -> Option<&SigningKeyPair> {
        self.signing.as_ref()
    }

    pub fn user_id(&self) -> UserId {
        derive_id(self.encryption.public_key())
    }

    pub fn to_identity(&self, username: impl Into<String>) -> PeerIdentity {
        PeerIdentity::new(
            *self.encryption.public_key(),
            self.signing.as_ref().map(|s| *s.public_key()),
            username,
        )
    }

    /// Wrap both private halves under a password-derived key.
    pub fn wrap(&self, password: &[u8], params: &KdfParams) -> Result<WrappedKey, CryptoError> {
        let mut packed = Zeroizing::new(Vec::with_capacity(PACKED_LEN_WITH_SIGNING));
        packed.extend_from_slice(self.encryption.private_key());
        match &self.signing {
            Some(signing) => {
                packed.push(1);
                packed.extend_from_slice(signing.private_key());
            }
            None => packed.push(0),
        }
        wrap_private_key(&packed, password, params)
    }

    pub fn unwrap(wrapped: &WrappedKey, password: &[u8]) -> Result<Self, MurmurError> {
        let packed = unwrap_private_key(wrapped, password)?;
        let malformed = CryptoError::MalformedInput("unexpected wrapped key layout");

        let (encryption, signing) = match (packed.len(), packed.get(32)) {
            (PACKED_LEN_WITHOUT_SIGNING, Some(0)) => (&packed[..32], None),
            (PACKED_LEN_WITH_SIGNING, Some(1)) => (&packed[..32], Some(&packed[33..65])),
            _ => return Err(malformed.into()),
        };

        let mut private = [0u8; 32];
        private.copy_from_slice(encryption);
        let signing_private = signing.map(|bytes| {
            let mut key = [0u8; 32];
            key.copy_from_slice(bytes);
            key
        });

        Ok(Self::import(private, None, signing_private)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> KdfParams {
        KdfParams {
            ops_cost: 1,
            mem_cost: 256,
            parallelism: 1,
        }
    }

    #[test]
    fn test_identity_id_is_public_key_hash() {
        let keys = KeyMaterial::generate();
        let identity = keys.to_identity("alice");
        assert_eq!(identity.id, derive_id(keys.encryption().public_key()));
        assert!(identity.verify().is_ok());
    }

    #[test]
    fn test_claimed_id_mismatch_rejected() {
        let keys = KeyMaterial::generate();
        let result = PeerIdentity::from_claimed(
            UserId([9u8; 32]),
            *keys.encryption().public_key(),
            None,
            "mallory",
        );
        assert_eq!(result.unwrap_err(), IdentityError::IdMismatch);
    }

    #[test]
    fn test_import_derives_public_half() {
        let keys = KeyMaterial::generate();
        let imported = KeyMaterial::import(*keys.encryption().private_key(), None, None).unwrap();
        assert_eq!(imported.user_id(), keys.user_id());
    }

    #[test]
    fn test_import_rejects_mismatched_public() {
        let keys = KeyMaterial::generate();
        let result = KeyMaterial::import(*keys.encryption().private_key(), Some([1u8; 32]), None);
        assert_eq!(result.unwrap_err(), IdentityError::KeyMismatch);
    }

    #[test]
    fn test_wrap_roundtrip() {
        let keys = KeyMaterial::generate();
        let wrapped = keys.wrap(b"passphrase", &test_params()).unwrap();
        let restored = KeyMaterial::unwrap(&wrapped, b"passphrase").unwrap();

        assert_eq!(restored.user_id(), keys.user_id());
        assert_eq!(
            restored.signing().map(|s| *s.public_key()),
            keys.signing().map(|s| *s.public_key())
        );
    }

    #[test]
    fn test_unwrap_wrong_password() {
        let keys = KeyMaterial::generate();
        let wrapped = keys.wrap(b"right", &test_params()).unwrap();
        assert!(matches!(
            KeyMaterial::unwrap(&wrapped, b"wrong"),
            Err(MurmurError::Crypto(CryptoError::AuthenticationFailed))
        ));
    }
}
