//! Realtime channel contract.
//!
//! The transport itself lives outside this crate; only the shapes it must
//! carry are defined here.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::{ChatId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Realtime channel is not connected")]
    NotConnected,

    #[error("Realtime channel is already connected")]
    AlreadyConnected,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Realtime channel closed")]
    Closed,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    NotifyReceiver { creator_id: UserId, chat_id: ChatId },
    NotificationAccepted,
    NotificationRefused,
    ReceiveMessage { sender_id: UserId, ciphertext: String },
    NotifyUpdatedKeys,
}

impl ChannelEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotifyReceiver { .. } => "NotifyReceiver",
            Self::NotificationAccepted => "NotificationAccepted",
            Self::NotificationRefused => "NotificationRefused",
            Self::ReceiveMessage { .. } => "ReceiveMessage",
            Self::NotifyUpdatedKeys => "NotifyUpdatedKeys",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinChatRequest {
    pub user_id: UserId,
    pub target_id: UserId,
    pub chat_id: ChatId,
    pub accepted: bool,
}

/// Authoritative `{id, status}` reply to `JoinChat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinChatResponse {
    pub id: ChatId,
    pub status: String,
}

/// Base64 public keys registered for a chat, from the caller's viewpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicKeysResponse {
    pub user_public_key: Option<String>,
    pub other_user_public_key: Option<String>,
}

/// Outbound RPCs and the inbound event stream of one user's connection.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Open the connection for `user_id` and return its event stream.
    async fn open(&self, user_id: UserId) -> Result<mpsc::Receiver<ChannelEvent>, ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;

    async fn join_chat(&self, request: JoinChatRequest) -> Result<JoinChatResponse, ChannelError>;

    async fn send_message(&self, chat_id: ChatId, ciphertext: String) -> Result<(), ChannelError>;

    async fn register_public_key(&self, public_key: String, chat_id: ChatId) -> Result<(), ChannelError>;

    async fn get_public_keys(&self, chat_id: ChatId) -> Result<PublicKeysResponse, ChannelError>;

    /// Tell the counterpart to refetch keys after a rotation.
    async fn notify_updated_keys(&self, chat_id: ChatId) -> Result<(), ChannelError>;
}
