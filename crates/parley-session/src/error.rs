//! Session error taxonomy.
//!
//! Lower layers are converted here before reaching the state machine.
//! Nothing in this enum is fatal to the process.

use parley_core::kv::StoreError;
use parley_crypto::{CryptoError, KeyStoreError};

use crate::channel::ChannelError;
use crate::model::ChatId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Decrypt or unwrap failed. The message renders as undecryptable.
    #[error("CryptoFailure: {0}")]
    CryptoFailure(String),

    /// No usable private key; the user must re-invite.
    #[error("No usable key for chat {0}")]
    KeyAbsent(ChatId),

    /// The key TTL passed; the conversation has been expired.
    #[error("Key for chat {0} expired")]
    KeyExpired(ChatId),

    /// RPC rejected or the channel is down.
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] ChannelError),

    /// Operation not valid in the current state, or already in flight.
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        Self::CryptoFailure(e.to_string())
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<KeyStoreError> for SessionError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::Storage(e) => e.into(),
            KeyStoreError::Crypto(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
