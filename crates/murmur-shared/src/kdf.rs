//! Password-based key derivation and private-key wrapping.
//!
//! Keys are derived with Argon2id only. Every wrap draws a fresh salt and a
//! fresh nonce, and the salt travels with the wrapped bytes.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::constants::SALT_SIZE;
use crate::crypto::{decrypt_group, encrypt_group, SymmetricKey};
use crate::error::CryptoError;

/// Minimum salt length accepted by the derivation.
const MIN_SALT_LEN: usize = 8;

/// Argon2id cost parameters.
///
/// | Parameter     | Default | Meaning                     |
/// |---------------|---------|-----------------------------|
/// | `ops_cost`    | 3       | Number of passes            |
/// | `mem_cost`    | 65 536  | Memory in KiB (64 MiB)      |
/// | `parallelism` | 1       | Lanes                       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub ops_cost: u32,
    pub mem_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            ops_cost: 3,
            mem_cost: 65_536,
            parallelism: 1,
        }
    }
}

/// Wrapped key bytes plus everything needed to unwrap them except the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// nonce || ciphertext
    pub wrapped: Vec<u8>,
    pub salt: [u8; SALT_SIZE],
    pub params: KdfParams,
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit key from a password with Argon2id.
///
/// Intentionally slow; async callers run it on `spawn_blocking`.
pub fn derive_key_from_password(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<SymmetricKey>, CryptoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "salt must be at least {MIN_SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }

    let argon2_params = argon2::Params::new(
        params.mem_cost,
        params.ops_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CryptoError::KeyDerivation(format!("invalid Argon2 parameters: {e}")))?;

    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    );

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password, salt, &mut output[..])
        .map_err(|e| CryptoError::KeyDerivation(format!("Argon2id failed: {e}")))?;

    Ok(output)
}

pub fn wrap_private_key(
    key: &[u8],
    password: &[u8],
    params: &KdfParams,
) -> Result<WrappedKey, CryptoError> {
    let salt = generate_salt();
    let wrapping_key = derive_key_from_password(password, &salt, params)?;
    let wrapped = encrypt_group(key, &wrapping_key)?;
    Ok(WrappedKey {
        wrapped,
        salt,
        params: *params,
    })
}

/// A wrong password surfaces as `AuthenticationFailed`.
pub fn unwrap_private_key(
    wrapped: &WrappedKey,
    password: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let wrapping_key = derive_key_from_password(password, &wrapped.salt, &wrapped.params)?;
    decrypt_group(&wrapped.wrapped, &wrapping_key).map(Zeroizing::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Light parameters suitable for fast unit tests.
    fn test_params() -> KdfParams {
        KdfParams {
            ops_cost: 1,
            mem_cost: 256,
            parallelism: 1,
        }
    }

    #[test]
    fn test_derivation_deterministic() {
        let salt = b"0123456789abcdef";
        let a = derive_key_from_password(b"pw", salt, &test_params()).unwrap();
        let b = derive_key_from_password(b"pw", salt, &test_params()).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_different_salt_different_key() {
        let a = derive_key_from_password(b"pw", b"salt_aaaaaaa_aaa", &test_params()).unwrap();
        let b = derive_key_from_password(b"pw", b"salt_bbbbbbb_bbb", &test_params()).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_short_salt_rejected() {
        assert!(matches!(
            derive_key_from_password(b"pw", b"short", &test_params()),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_zero_ops_cost_rejected() {
        let params = KdfParams {
            ops_cost: 0,
            ..test_params()
        };
        assert!(derive_key_from_password(b"pw", b"0123456789abcdef", &params).is_err());
    }

    #[test]
    fn test_wrap_unwrap() {
        let secret = [0x42u8; 32];
        let wrapped = wrap_private_key(&secret, b"hunter2", &test_params()).unwrap();
        let unwrapped = unwrap_private_key(&wrapped, b"hunter2").unwrap();
        assert_eq!(unwrapped.as_slice(), &secret);
    }

    #[test]
    fn test_wrap_uses_fresh_salt_and_nonce() {
        let secret = [0x42u8; 32];
        let a = wrap_private_key(&secret, b"pw", &test_params()).unwrap();
        let b = wrap_private_key(&secret, b"pw", &test_params()).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.wrapped, b.wrapped);
    }

    #[test]
    fn test_wrong_password_fails() {
        let wrapped = wrap_private_key(&[1u8; 32], b"right", &test_params()).unwrap();
        assert_eq!(
            unwrap_private_key(&wrapped, b"wrong").unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }
}
