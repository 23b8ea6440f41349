//! Parley E2E Encryption Library
//!
//! Per-conversation key material and the message pipeline for the Parley
//! chat client. The relay only ever sees sealed ciphertext.
//!
//! ## Crypto primitives
//!
//! - **Conversation keys**: X25519 key pair per conversation, rotated by TTL
//! - **Messages**: sealed box per message (ephemeral X25519 → HKDF-SHA256 →
//!   ChaCha20-Poly1305)
//! - **At rest**: private halves wrapped with AES-256-GCM under a
//!   PBKDF2-SHA256 (200,000 rounds) password-derived key

pub mod codec;
pub mod encoding;
pub mod error;
pub mod keypair;
pub mod keystore;
pub mod wrap;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use codec::{Ciphertext, MessageCodec, SealedPair};
pub use error::CryptoError;
pub use keypair::{ConversationKeyPair, PUBLIC_KEY_SIZE, PublicKeyBytes, fingerprint_of};
pub use keystore::{KeyLookup, KeyPairRecord, KeyStore, KeyStoreError};
pub use wrap::{WrappedKey, unwrap_secret, wrap_secret};
