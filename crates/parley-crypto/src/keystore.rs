//! Encrypted-at-rest storage of conversation private keys.
//!
//! One [`KeyPairRecord`] per conversation, kept in the `keys` namespace of
//! the key-value collaborator. Records past `expires_at` are treated as
//! absent and deleted on the read that notices them.

use std::sync::Arc;
use std::time::Duration;

use parley_core::clock::{Clock, deadline_after};
use parley_core::config::DEFAULT_PBKDF2_ITERATIONS;
use parley_core::kv::{KeyValueStore, Namespace, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keypair::{ConversationKeyPair, PublicKeyBytes};
use crate::wrap::{WrappedKey, unwrap_secret, wrap_secret};

/// Errors that reach the caller of [`KeyStore`]. Decrypt failures are not
/// among them; those surface as [`KeyLookup::Undecryptable`].
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("Key store backend failed: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Persisted form of one conversation key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairRecord {
    pub conversation_id: u64,
    /// Base64 of the raw 32-byte public half.
    pub public_key: String,
    pub wrapped_private_key: WrappedKey,
    pub iterations: u32,
    pub created_at: i64,
    pub expires_at: i64,
}

impl KeyPairRecord {
    pub const fn is_expired(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at
    }
}

/// Outcome of reading a conversation's private key.
#[derive(Debug)]
pub enum KeyLookup {
    Found(ConversationKeyPair),
    /// Nothing stored.
    Absent,
    /// A record existed but its TTL had passed. It has now been deleted.
    Expired,
    /// Wrong password or corrupted blob.
    Undecryptable,
}

impl KeyLookup {
    pub fn into_found(self) -> Option<ConversationKeyPair> {
        match self {
            Self::Found(kp) => Some(kp),
            Self::Absent | Self::Expired | Self::Undecryptable => None,
        }
    }
}

fn record_key(conversation_id: u64) -> String {
    format!("chat_key_{conversation_id}")
}

/// Password-wrapped, TTL-bounded key storage.
#[derive(Clone)]
pub struct KeyStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    iterations: u32,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }

    /// Override the PBKDF2 round count used for new records.
    #[must_use]
    pub const fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Fresh key pair. Nothing is stored.
    pub fn generate() -> ConversationKeyPair {
        ConversationKeyPair::generate()
    }

    /// Wrap and store `keypair` for `conversation_id`, replacing any prior
    /// record. Returns the new `expires_at`.
    pub async fn persist(
        &self,
        conversation_id: u64,
        keypair: &ConversationKeyPair,
        password: &str,
        ttl: Duration,
    ) -> Result<i64, KeyStoreError> {
        let secret = keypair.export_secret();
        let password = Zeroizing::new(password.to_owned());
        let iterations = self.iterations;
        let wrapped = tokio::task::spawn_blocking(move || wrap_secret(&secret[..], &password, iterations))
            .await
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))??;

        let now = self.clock.now_millis();
        let record = KeyPairRecord {
            conversation_id,
            public_key: keypair.public_key().to_base64(),
            wrapped_private_key: wrapped,
            iterations,
            created_at: now,
            expires_at: deadline_after(now, ttl),
        };
        self.write(&record).await?;
        info!(
            conversation_id,
            fingerprint = %keypair.fingerprint(),
            expires_at = record.expires_at,
            "Persisted conversation key"
        );
        Ok(record.expires_at)
    }

    /// Load and unwrap the private key, distinguishing why it is unusable.
    pub async fn lookup(&self, conversation_id: u64, password: &str) -> Result<KeyLookup, KeyStoreError> {
        let Some(record) = self.read_live(conversation_id).await? else {
            return Ok(KeyLookup::Absent);
        };
        let record = match record {
            Live::Expired => return Ok(KeyLookup::Expired),
            Live::Corrupt => return Ok(KeyLookup::Undecryptable),
            Live::Record(record) => record,
        };

        let password = Zeroizing::new(password.to_owned());
        let unwrapped = tokio::task::spawn_blocking(move || {
            unwrap_secret(&record.wrapped_private_key, &password, record.iterations)
                .and_then(|secret| ConversationKeyPair::from_secret_bytes(&secret))
        })
        .await
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        match unwrapped {
            Ok(kp) => Ok(KeyLookup::Found(kp)),
            Err(e) => {
                warn!(conversation_id, error = %e, "CryptoFailure: could not unwrap conversation key");
                Ok(KeyLookup::Undecryptable)
            }
        }
    }

    /// The usable private key, or `None` for every non-usable outcome.
    pub async fn retrieve(
        &self,
        conversation_id: u64,
        password: &str,
    ) -> Result<Option<ConversationKeyPair>, KeyStoreError> {
        Ok(self.lookup(conversation_id, password).await?.into_found())
    }

    /// Delete the record. Missing records are fine.
    pub async fn purge(&self, conversation_id: u64) -> Result<(), KeyStoreError> {
        self.store
            .delete(Namespace::Keys, &record_key(conversation_id))
            .await?;
        debug!(conversation_id, "Purged conversation key");
        Ok(())
    }

    /// Extend `expires_at` to at least `now + ttl`. Never shortens it.
    /// Returns the resulting deadline, or `None` if no live record exists.
    pub async fn touch(&self, conversation_id: u64, ttl: Duration) -> Result<Option<i64>, KeyStoreError> {
        let Some(Live::Record(mut record)) = self.read_live(conversation_id).await? else {
            return Ok(None);
        };
        let renewed = deadline_after(self.clock.now_millis(), ttl);
        if renewed > record.expires_at {
            record.expires_at = renewed;
            self.write(&record).await?;
        }
        Ok(Some(record.expires_at))
    }

    /// Public half of the stored pair, without unwrapping the private half.
    pub async fn public_key(&self, conversation_id: u64) -> Result<Option<PublicKeyBytes>, KeyStoreError> {
        match self.read_live(conversation_id).await? {
            Some(Live::Record(record)) => Ok(PublicKeyBytes::from_base64(&record.public_key).ok()),
            _ => Ok(None),
        }
    }

    /// Deadline of the stored record, if one exists and has not expired.
    pub async fn expires_at(&self, conversation_id: u64) -> Result<Option<i64>, KeyStoreError> {
        match self.read_live(conversation_id).await? {
            Some(Live::Record(record)) => Ok(Some(record.expires_at)),
            _ => Ok(None),
        }
    }

    async fn write(&self, record: &KeyPairRecord) -> Result<(), KeyStoreError> {
        let bytes = serde_json::to_vec(record).map_err(|e| CryptoError::SerializationError(e.to_string()))?;
        self.store
            .put(Namespace::Keys, &record_key(record.conversation_id), bytes)
            .await?;
        Ok(())
    }

    /// Read a record, applying lazy expiry.
    async fn read_live(&self, conversation_id: u64) -> Result<Option<Live>, KeyStoreError> {
        let key = record_key(conversation_id);
        let Some(bytes) = self.store.get(Namespace::Keys, &key).await? else {
            return Ok(None);
        };
        let record: KeyPairRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(conversation_id, error = %e, "CryptoFailure: unreadable key record");
                return Ok(Some(Live::Corrupt));
            }
        };
        if record.is_expired(self.clock.now_millis()) {
            self.store.delete(Namespace::Keys, &key).await?;
            info!(conversation_id, expires_at = record.expires_at, "Conversation key expired, purged");
            return Ok(Some(Live::Expired));
        }
        Ok(Some(Live::Record(Box::new(record))))
    }
}

enum Live {
    Record(Box<KeyPairRecord>),
    Expired,
    Corrupt,
}
