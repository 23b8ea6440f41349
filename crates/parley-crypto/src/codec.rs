//! Per-message encryption.
//!
//! Each message is sealed to one recipient public key: a fresh ephemeral
//! X25519 key performs ECDH with the recipient, HKDF-SHA256 derives a
//! ChaCha20-Poly1305 key, and the UTF-8 plaintext is sealed under a random
//! nonce.
//!
//! Wire layout: `[32-byte ephemeral public] [12-byte nonce] [ciphertext + 16-byte tag]`

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::encoding;
use crate::error::CryptoError;
use crate::keypair::{ConversationKeyPair, PUBLIC_KEY_SIZE, PublicKeyBytes};

/// HKDF info prefix for message key derivation.
const HKDF_INFO: &[u8] = b"parley-e2e-message-v1";

/// HKDF salt for domain separation (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"parley-e2e-hkdf-salt-v1";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE;

/// A sealed message, exactly as it travels on the wire (before base64).
#[derive(Clone, PartialEq, Eq)]
pub struct Ciphertext(Vec<u8>);

impl std::fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ciphertext({} bytes)", self.0.len())
    }
}

impl Ciphertext {
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        encoding::from_base64(encoded).map(Self)
    }

    pub fn to_base64(&self) -> String {
        encoding::to_base64(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// The two ciphertexts produced for every outbound message.
#[derive(Debug, Clone)]
pub struct SealedPair {
    /// Sealed to our own public key, kept in local history.
    pub local: Ciphertext,
    /// Sealed to the counterpart, sent over the realtime channel.
    pub wire: Ciphertext,
}

/// Stateless message encryption/decryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Seal `plaintext` so that only the holder of `recipient`'s private half
    /// can read it.
    pub fn encrypt_for(plaintext: &str, recipient: &PublicKeyBytes) -> Result<Ciphertext, CryptoError> {
        let recipient_public = recipient.to_dalek();
        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&recipient_public);
        if !shared.was_contributory() {
            return Err(CryptoError::WeakPublicKey);
        }
        let cipher = message_cipher(shared.as_bytes(), &ephemeral_public, &recipient_public)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(Ciphertext(out))
    }

    /// Seal a self-readable copy for local history.
    pub fn encrypt_for_self(plaintext: &str, my_public: &PublicKeyBytes) -> Result<Ciphertext, CryptoError> {
        Self::encrypt_for(plaintext, my_public)
    }

    /// Produce the local-history copy and the wire copy of one outbound
    /// message. The two never share a ciphertext.
    pub fn seal_outbound(
        plaintext: &str,
        my_public: &PublicKeyBytes,
        counterpart_public: &PublicKeyBytes,
    ) -> Result<SealedPair, CryptoError> {
        Ok(SealedPair {
            local: Self::encrypt_for_self(plaintext, my_public)?,
            wire: Self::encrypt_for(plaintext, counterpart_public)?,
        })
    }

    /// Open a sealed message with our private key.
    ///
    /// Any failure (truncation, wrong key, tampering, non-UTF-8 payload)
    /// surfaces as `DecryptionFailed`; a wrong key never yields plaintext.
    pub fn decrypt(ciphertext: &Ciphertext, keypair: &ConversationKeyPair) -> Result<String, CryptoError> {
        let bytes = ciphertext.as_bytes();
        if bytes.len() < HEADER_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "ciphertext too short: {} bytes",
                bytes.len()
            )));
        }
        let (header, sealed) = bytes.split_at(HEADER_SIZE);
        let (ephemeral_bytes, nonce_bytes) = header.split_at(PUBLIC_KEY_SIZE);
        let ephemeral_public = PublicKeyBytes::from_slice(ephemeral_bytes)?.to_dalek();

        let opened = open_with(keypair.secret(), &ephemeral_public, nonce_bytes, sealed)?;
        String::from_utf8(opened.to_vec())
            .map_err(|e| CryptoError::DecryptionFailed(format!("plaintext is not UTF-8: {e}")))
    }
}

fn open_with(
    secret: &StaticSecret,
    ephemeral_public: &PublicKey,
    nonce_bytes: &[u8],
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let shared = secret.diffie_hellman(ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed("non-contributory ephemeral key".into()));
    }
    let my_public = PublicKey::from(secret);
    let cipher = message_cipher(shared.as_bytes(), ephemeral_public, &my_public)?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Derive the per-message AEAD from the ECDH output, bound to both public keys.
fn message_cipher(
    shared_secret: &[u8; 32],
    ephemeral_public: &PublicKey,
    recipient_public: &PublicKey,
) -> Result<ChaCha20Poly1305, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut info = Vec::with_capacity(HKDF_INFO.len() + 2 * PUBLIC_KEY_SIZE);
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(ephemeral_public.as_bytes());
    info.extend_from_slice(recipient_public.as_bytes());

    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut key[..])
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let kp = ConversationKeyPair::generate();
        let long = "x".repeat(64 * 1024);
        for plaintext in ["hello", "", "olá, mundo 🔐", long.as_str()] {
            let sealed = MessageCodec::encrypt_for(plaintext, &kp.public_key()).unwrap();
            assert_eq!(MessageCodec::decrypt(&sealed, &kp).unwrap(), plaintext);
        }
    }

    #[test]
    fn wrong_key_is_a_failure_not_garbage() {
        let intended = ConversationKeyPair::generate();
        let other = ConversationKeyPair::generate();

        let sealed = MessageCodec::encrypt_for("secret data", &intended.public_key()).unwrap();
        let result = MessageCodec::decrypt(&sealed, &other);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn same_plaintext_seals_differently() {
        let kp = ConversationKeyPair::generate();
        let a = MessageCodec::encrypt_for("hello", &kp.public_key()).unwrap();
        let b = MessageCodec::encrypt_for("hello", &kp.public_key()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn seal_outbound_produces_distinct_readable_copies() {
        let me = ConversationKeyPair::generate();
        let them = ConversationKeyPair::generate();

        let pair = MessageCodec::seal_outbound("hello", &me.public_key(), &them.public_key()).unwrap();
        assert_ne!(pair.local, pair.wire);
        assert_eq!(MessageCodec::decrypt(&pair.local, &me).unwrap(), "hello");
        assert_eq!(MessageCodec::decrypt(&pair.wire, &them).unwrap(), "hello");
        // Neither side can read the other's copy.
        assert!(MessageCodec::decrypt(&pair.local, &them).is_err());
        assert!(MessageCodec::decrypt(&pair.wire, &me).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let kp = ConversationKeyPair::generate();
        let sealed = MessageCodec::encrypt_for("secret", &kp.public_key()).unwrap();
        let mut bytes = sealed.into_bytes();
        if let Some(byte) = bytes.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(MessageCodec::decrypt(&Ciphertext::from_bytes(bytes), &kp).is_err());
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let kp = ConversationKeyPair::generate();
        let result = MessageCodec::decrypt(&Ciphertext::from_bytes(vec![0u8; 20]), &kp);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn low_order_recipient_is_rejected() {
        let zero = PublicKeyBytes::from_slice(&[0u8; 32]).unwrap();
        assert!(matches!(
            MessageCodec::encrypt_for("hi", &zero),
            Err(CryptoError::WeakPublicKey)
        ));
    }

    #[test]
    fn base64_wire_roundtrip_is_byte_exact() {
        let kp = ConversationKeyPair::generate();
        let sealed = MessageCodec::encrypt_for("hello", &kp.public_key()).unwrap();
        let decoded = Ciphertext::from_base64(&sealed.to_base64()).unwrap();
        assert_eq!(decoded, sealed);
        assert_eq!(MessageCodec::decrypt(&decoded, &kp).unwrap(), "hello");
    }
}
