//! Password wrapping for private key material at rest.
//!
//! A 256-bit key is derived from the user's password with PBKDF2-SHA256
//! over a random 16-byte salt, then AES-256-GCM seals the secret under a
//! random 12-byte IV. Salt and IV are stored alongside the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::encoding::base64_bytes;
use crate::error::CryptoError;

pub const SALT_SIZE: usize = 16;
pub const IV_SIZE: usize = 12;
const WRAP_KEY_SIZE: usize = 32;

/// A secret sealed under a password-derived key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedKey")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv", &hex::encode(&self.iv))
            .field("salt", &hex::encode(&self.salt))
            .finish()
    }
}

fn derive_wrap_key(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; WRAP_KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; WRAP_KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
    key
}

fn wrap_cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
}

/// Seal `secret` under `password`. CPU-bound; call from a blocking context.
pub fn wrap_secret(secret: &[u8], password: &str, iterations: u32) -> Result<WrappedKey, CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_wrap_key(password, &salt, iterations);
    let ciphertext = wrap_cipher(&key[..])?
        .encrypt(Nonce::from_slice(&iv), secret)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(WrappedKey {
        ciphertext,
        iv: iv.to_vec(),
        salt: salt.to_vec(),
    })
}

/// Open a [`WrappedKey`]. A wrong password or a corrupted blob both fail
/// authentication; no partial plaintext is ever returned.
pub fn unwrap_secret(
    wrapped: &WrappedKey,
    password: &str,
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if wrapped.iv.len() != IV_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: IV_SIZE,
            actual: wrapped.iv.len(),
        });
    }
    if wrapped.salt.len() != SALT_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: SALT_SIZE,
            actual: wrapped.salt.len(),
        });
    }

    let key = derive_wrap_key(password, &wrapped.salt, iterations);
    wrap_cipher(&key[..])?
        .decrypt(Nonce::from_slice(&wrapped.iv), wrapped.ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ROUNDS: u32 = 1_000;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let secret = [42u8; 32];
        let wrapped = wrap_secret(&secret, "correct horse", ROUNDS).unwrap();
        assert_eq!(wrapped.salt.len(), SALT_SIZE);
        assert_eq!(wrapped.iv.len(), IV_SIZE);
        assert_ne!(wrapped.ciphertext.as_slice(), secret.as_slice());

        let opened = unwrap_secret(&wrapped, "correct horse", ROUNDS).unwrap();
        assert_eq!(opened.as_slice(), secret.as_slice());
    }

    #[test]
    fn salt_and_iv_are_fresh_per_wrap() {
        let a = wrap_secret(b"same", "pw", ROUNDS).unwrap();
        let b = wrap_secret(b"same", "pw", ROUNDS).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_password_fails() {
        let wrapped = wrap_secret(b"secret", "right", ROUNDS).unwrap();
        assert!(matches!(
            unwrap_secret(&wrapped, "wrong", ROUNDS),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn iteration_count_is_part_of_the_key() {
        let wrapped = wrap_secret(b"secret", "pw", ROUNDS).unwrap();
        assert!(unwrap_secret(&wrapped, "pw", ROUNDS + 1).is_err());
    }

    #[test]
    fn corrupted_blob_fails() {
        let mut wrapped = wrap_secret(b"secret", "pw", ROUNDS).unwrap();
        wrapped.ciphertext[0] ^= 0x01;
        assert!(unwrap_secret(&wrapped, "pw", ROUNDS).is_err());

        let mut short_iv = wrap_secret(b"secret", "pw", ROUNDS).unwrap();
        short_iv.iv.truncate(4);
        assert!(matches!(
            unwrap_secret(&short_iv, "pw", ROUNDS),
            Err(CryptoError::InvalidKeyLength { expected: 12, actual: 4 })
        ));
    }

    #[test]
    fn serializes_as_base64_json() {
        let wrapped = wrap_secret(b"secret", "pw", ROUNDS).unwrap();
        let json = serde_json::to_value(&wrapped).unwrap();
        assert!(json["salt"].is_string());
        assert!(json["iv"].is_string());

        let back: WrappedKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, wrapped);
    }
}
