//! Conversation key pairs.
//!
//! Every conversation gets its own X25519 key pair. The public half is
//! registered with the counterpart; the private half only ever leaves
//! memory wrapped (see [`crate::wrap`]).

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::encoding;
use crate::error::CryptoError;

/// Raw size of either half of a key pair.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An X25519 key pair owned by one side of one conversation.
#[derive(Clone)]
pub struct ConversationKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for ConversationKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl ConversationKeyPair {
    /// Generate a new random key pair. No side effects.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from the raw 32-byte private half.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        arr.zeroize();
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes(*self.public.as_bytes())
    }

    /// Export the private half. Handle with care.
    pub fn export_secret(&self) -> Zeroizing<[u8; PUBLIC_KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub(crate) const fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// SHA-256 fingerprint of the public half.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.public.as_bytes())
    }
}

/// Exported public half of a conversation key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKeyBytes([u8; PUBLIC_KEY_SIZE]);

impl std::fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKeyBytes({})", hex::encode(self.0))
    }
}

impl PublicKeyBytes {
    /// Import raw exported bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        Self::from_slice(&encoding::from_base64(encoded)?)
    }

    pub fn to_base64(&self) -> String {
        encoding::to_base64(&self.0)
    }

    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub(crate) fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.0)
    }
}

/// Compute a colon-separated hex fingerprint from raw public key bytes.
pub fn fingerprint_of(pubkey_bytes: &[u8; PUBLIC_KEY_SIZE]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(pubkey_bytes);
    hash.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn export_import_secret_roundtrip() {
        let kp = ConversationKeyPair::generate();
        let exported = kp.export_secret();

        let restored = ConversationKeyPair::from_secret_bytes(&exported[..]).unwrap();
        assert_eq!(*restored.export_secret(), *exported);
        assert_eq!(restored.public_key(), kp.public_key());
    }

    #[test]
    fn export_import_public_roundtrip() {
        let kp = ConversationKeyPair::generate();
        let public = kp.public_key();

        let via_slice = PublicKeyBytes::from_slice(public.as_bytes()).unwrap();
        let via_base64 = PublicKeyBytes::from_base64(&public.to_base64()).unwrap();
        assert_eq!(via_slice, public);
        assert_eq!(via_base64, public);
    }

    #[test]
    fn two_keypairs_are_distinct() {
        let kp1 = ConversationKeyPair::generate();
        let kp2 = ConversationKeyPair::generate();
        assert_ne!(kp1.public_key(), kp2.public_key());
        assert_ne!(*kp1.export_secret(), *kp2.export_secret());
    }

    #[test]
    fn from_secret_bytes_rejects_wrong_length() {
        let err = ConversationKeyPair::from_secret_bytes(&[0u8; 16]).unwrap_err();
        match err {
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16,
            } => {}
            _ => panic!("wrong error: {err:?}"),
        }
    }

    #[test]
    fn public_from_base64_rejects_wrong_length() {
        let short = encoding::to_base64(&[7u8; 31]);
        assert!(matches!(
            PublicKeyBytes::from_base64(&short),
            Err(CryptoError::InvalidKeyLength { actual: 31, .. })
        ));
    }

    #[test]
    fn fingerprint_is_human_readable_hex() {
        let fp = ConversationKeyPair::generate().fingerprint();

        // SHA-256 = 32 hex pairs + 31 colons
        assert_eq!(fp.len(), 95);
        for segment in fp.split(':') {
            assert_eq!(segment.len(), 2);
            assert!(segment.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn debug_impl_redacts_secret() {
        let kp = ConversationKeyPair::generate();
        let debug_output = format!("{kp:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains(&hex::encode(*kp.export_secret())));
    }
}
