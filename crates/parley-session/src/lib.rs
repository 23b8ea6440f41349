//! Parley session layer.
//!
//! The handshake state machine that turns invite/accept/refuse events into
//! per-conversation key material:
//!
//! - [`SessionRegistry`]: chatId → [`SessionState`], mutated through a
//!   closed set of [`SessionEvent`]s
//! - [`KeyExchangeCoordinator`]: drives the registry, the key store and the
//!   realtime channel
//! - [`ExpirationScheduler`]: one per-process timer that forces expiry
//! - [`LoopbackHub`]: in-process server emulation for tests and demos

pub mod channel;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod loopback;
pub mod model;
pub mod reducer;
pub mod registry;
pub mod scheduler;

pub use channel::{ChannelError, ChannelEvent, JoinChatRequest, JoinChatResponse, PublicKeysResponse, RealtimeChannel};
pub use connection::{ConnectionManager, ConnectionState};
pub use coordinator::{CoordinatorConfig, KeyExchangeCoordinator};
pub use error::SessionError;
pub use history::MessageHistory;
pub use loopback::{LoopbackChannel, LoopbackHub};
pub use model::{
    ChatId, ChatStatus, Conversation, ConversationSummary, Direction, EncryptedMessage, KeyOwner,
    MessageBody, PendingInvitation, RenderedMessage, ServerStatus, SessionState, UserId,
};
pub use reducer::SessionEvent;
pub use registry::{SessionPatch, SessionRegistry};
pub use scheduler::{ExpirationScheduler, ExpiryHandler, SchedulerHandle};
