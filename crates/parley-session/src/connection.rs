//! Explicit ownership of the realtime connection.
//!
//! One `ConnectionManager` per process, passed by reference to whoever
//! needs the channel. RPCs are refused while disconnected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelError, ChannelEvent, JoinChatRequest, JoinChatResponse, PublicKeysResponse, RealtimeChannel,
};
use crate::model::{ChatId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct ConnectionManager {
    channel: Arc<dyn RealtimeChannel>,
    state: RwLock<ConnectionState>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(channel: Arc<dyn RealtimeChannel>) -> Self {
        Self {
            channel,
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Open the channel as `user_id`. Fails with `AlreadyConnected` if a
    /// connection is up or being established.
    pub async fn connect(&self, user_id: UserId) -> Result<mpsc::Receiver<ChannelEvent>, ChannelError> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(ChannelError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        match self.channel.open(user_id).await {
            Ok(events) => {
                *self.state.write().await = ConnectionState::Connected;
                info!(user_id = %user_id, "Realtime channel connected");
                Ok(events)
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                warn!(user_id = %user_id, error = %e, "Realtime channel connect failed");
                Err(e)
            }
        }
    }

    /// Close the channel. Disconnecting twice is fine.
    pub async fn disconnect(&self) -> Result<(), ChannelError> {
        let mut state = self.state.write().await;
        if *state == ConnectionState::Disconnected {
            return Ok(());
        }
        let result = self.channel.close().await;
        *state = ConnectionState::Disconnected;
        info!("Realtime channel disconnected");
        result
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn ensure_connected(&self) -> Result<(), ChannelError> {
        if self.is_connected().await {
            Ok(())
        } else {
            Err(ChannelError::NotConnected)
        }
    }

    pub async fn join_chat(&self, request: JoinChatRequest) -> Result<JoinChatResponse, ChannelError> {
        self.ensure_connected().await?;
        self.channel.join_chat(request).await
    }

    pub async fn send_message(&self, chat_id: ChatId, ciphertext: String) -> Result<(), ChannelError> {
        self.ensure_connected().await?;
        self.channel.send_message(chat_id, ciphertext).await
    }

    pub async fn register_public_key(&self, public_key: String, chat_id: ChatId) -> Result<(), ChannelError> {
        self.ensure_connected().await?;
        self.channel.register_public_key(public_key, chat_id).await
    }

    /// `RegisterPublicKey` with linear backoff between attempts.
    pub async fn register_public_key_with_retry(
        &self,
        public_key: &str,
        chat_id: ChatId,
        attempts: u32,
        backoff: Duration,
    ) -> Result<(), ChannelError> {
        let attempts = attempts.max(1);
        let mut last_err = ChannelError::NotConnected;
        for attempt in 1..=attempts {
            match self.register_public_key(public_key.to_owned(), chat_id).await {
                Ok(()) => {
                    debug!(chat_id = %chat_id, attempt, "Public key registered");
                    return Ok(());
                }
                Err(ChannelError::NotConnected) => return Err(ChannelError::NotConnected),
                Err(e) => {
                    warn!(chat_id = %chat_id, attempt, attempts, error = %e, "RegisterPublicKey failed");
                    last_err = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff * attempt).await;
            }
        }
        Err(last_err)
    }

    pub async fn get_public_keys(&self, chat_id: ChatId) -> Result<PublicKeysResponse, ChannelError> {
        self.ensure_connected().await?;
        self.channel.get_public_keys(chat_id).await
    }

    pub async fn notify_updated_keys(&self, chat_id: ChatId) -> Result<(), ChannelError> {
        self.ensure_connected().await?;
        self.channel.notify_updated_keys(chat_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Rejects the first `failures` registrations.
    struct FlakyChannel {
        failures: u32,
        register_calls: AtomicU32,
    }

    impl FlakyChannel {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                register_calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RealtimeChannel for FlakyChannel {
        async fn open(&self, _user_id: UserId) -> Result<mpsc::Receiver<ChannelEvent>, ChannelError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn join_chat(&self, request: JoinChatRequest) -> Result<JoinChatResponse, ChannelError> {
            Ok(JoinChatResponse {
                id: request.chat_id,
                status: "Pending".into(),
            })
        }

        async fn send_message(&self, _chat_id: ChatId, _ciphertext: String) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn register_public_key(&self, _public_key: String, _chat_id: ChatId) -> Result<(), ChannelError> {
            let call = self.register_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ChannelError::Rejected("busy".into()))
            } else {
                Ok(())
            }
        }

        async fn get_public_keys(&self, _chat_id: ChatId) -> Result<PublicKeysResponse, ChannelError> {
            Ok(PublicKeysResponse::default())
        }

        async fn notify_updated_keys(&self, _chat_id: ChatId) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn rpcs_require_connection() {
        let manager = ConnectionManager::new(FlakyChannel::new(0));
        assert!(!manager.is_connected().await);
        assert_eq!(
            manager.get_public_keys(ChatId(5)).await.unwrap_err(),
            ChannelError::NotConnected
        );

        let _events = manager.connect(UserId(1)).await.unwrap();
        assert!(manager.is_connected().await);
        assert!(manager.get_public_keys(ChatId(5)).await.is_ok());

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(
            manager.send_message(ChatId(5), "x".into()).await.unwrap_err(),
            ChannelError::NotConnected
        );
    }

    #[tokio::test]
    async fn double_connect_is_rejected_and_disconnect_is_idempotent() {
        let manager = ConnectionManager::new(FlakyChannel::new(0));
        let _events = manager.connect(UserId(1)).await.unwrap();
        assert_eq!(
            manager.connect(UserId(1)).await.unwrap_err(),
            ChannelError::AlreadyConnected
        );
        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn register_retries_until_success() {
        let channel = FlakyChannel::new(2);
        let manager = ConnectionManager::new(channel.clone());
        let _events = manager.connect(UserId(1)).await.unwrap();

        manager
            .register_public_key_with_retry("key", ChatId(5), 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(channel.register_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn register_gives_up_after_attempts() {
        let channel = FlakyChannel::new(10);
        let manager = ConnectionManager::new(channel.clone());
        let _events = manager.connect(UserId(1)).await.unwrap();

        let err = manager
            .register_public_key_with_retry("key", ChatId(5), 2, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Rejected("busy".into()));
        assert_eq!(channel.register_calls.load(Ordering::SeqCst), 2);
    }
}
