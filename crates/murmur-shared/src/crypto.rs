use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::constants::{KDF_CONTEXT_DIRECT_KEY, NONCE_SIZE, SIGNATURE_SIZE, TAG_SIZE};
use crate::error::CryptoError;
use crate::types::UserId;

pub type SymmetricKey = [u8; 32];

/// X25519 key pair used for direct-message encryption only.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    public_key: [u8; 32],
    private_key: [u8; 32],
}

impl KeyPair {
    /// Rebuild a key pair from its private half; the public half is
    /// recomputed by scalar base multiplication.
    pub fn from_private(private_key: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_key);
        let public_key = PublicKey::from(&secret).to_bytes();
        Self {
            public_key,
            private_key: secret.to_bytes(),
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Ed25519 key pair used for envelope signatures only.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningKeyPair {
    public_key: [u8; 32],
    private_key: [u8; 32],
}

impl SigningKeyPair {
    pub fn from_private(private_key: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&private_key);
        Self {
            public_key: signing_key.verifying_key().to_bytes(),
            private_key,
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        sign(message, &self.private_key)
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    KeyPair::from_private(secret.to_bytes())
}

pub fn generate_signing_key_pair() -> SigningKeyPair {
    let signing_key = SigningKey::generate(&mut OsRng);
    SigningKeyPair::from_private(signing_key.to_bytes())
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Peer id = BLAKE3-256 of the X25519 public key.
pub fn derive_id(public_key: &[u8; 32]) -> UserId {
    UserId(*blake3::hash(public_key).as_bytes())
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn open(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::MalformedInput("sealed data shorter than nonce + tag"));
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

// X25519 shared secret -> BLAKE3 KDF. Both directions derive the same key.
fn direct_key(
    own_private: &[u8; 32],
    their_public: &[u8; 32],
) -> Result<Zeroizing<SymmetricKey>, CryptoError> {
    let secret = StaticSecret::from(*own_private);
    let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
    if !shared.was_contributory() {
        return Err(CryptoError::MalformedInput("low-order public key"));
    }
    Ok(Zeroizing::new(blake3::derive_key(
        KDF_CONTEXT_DIRECT_KEY,
        shared.as_bytes(),
    )))
}

pub fn encrypt_direct(
    plaintext: &[u8],
    recipient_public: &[u8; 32],
    sender_private: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let key = direct_key(sender_private, recipient_public)?;
    seal(&key, plaintext)
}

pub fn decrypt_direct(
    sealed: &[u8],
    sender_public: &[u8; 32],
    recipient_private: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let key = direct_key(recipient_private, sender_public)?;
    open(&key, sealed)
}

pub fn encrypt_group(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    seal(key, plaintext)
}

pub fn decrypt_group(sealed: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    open(key, sealed)
}

pub fn sign(message: &[u8], signing_private: &[u8; 32]) -> [u8; SIGNATURE_SIZE] {
    SigningKey::from_bytes(signing_private)
        .sign(message)
        .to_bytes()
}

/// Malformed keys or signatures verify as `false`.
pub fn verify(message: &[u8], signature: &[u8], signing_public: &[u8]) -> bool {
    let Ok(public) = <[u8; 32]>::try_from(signing_public) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}
