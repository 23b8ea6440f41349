//! In-process server emulation.
//!
//! `LoopbackHub` plays the chat server: it allocates canonical chat ids,
//! keeps the per-chat public key registry and fans events out to the
//! connected users. Each user talks to it through its own
//! [`LoopbackChannel`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info};

use crate::channel::{
    ChannelError, ChannelEvent, JoinChatRequest, JoinChatResponse, PublicKeysResponse, RealtimeChannel,
};
use crate::model::{ChatId, ServerStatus, UserId};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
struct ChatRecord {
    creator: UserId,
    target: UserId,
    status: ServerStatus,
}

impl ChatRecord {
    fn other(&self, user: UserId) -> Option<UserId> {
        if user == self.creator {
            Some(self.target)
        } else if user == self.target {
            Some(self.creator)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct HubState {
    next_id: u64,
    chats: HashMap<ChatId, ChatRecord>,
    by_pair: HashMap<(UserId, UserId), ChatId>,
    keys: HashMap<(ChatId, UserId), String>,
    subscribers: HashMap<UserId, mpsc::Sender<ChannelEvent>>,
}

impl HubState {
    fn allocate(&mut self, creator: UserId, target: UserId, status: ServerStatus) -> ChatId {
        let id = ChatId(self.next_id);
        self.next_id += 1;
        self.chats.insert(id, ChatRecord { creator, target, status });
        self.by_pair.insert(pair(creator, target), id);
        id
    }

    fn member_chat(&self, chat_id: ChatId, user: UserId) -> Result<(ChatRecord, UserId), ChannelError> {
        let record = self
            .chats
            .get(&chat_id)
            .copied()
            .ok_or_else(|| ChannelError::Rejected(format!("unknown chat {chat_id}")))?;
        let other = record
            .other(user)
            .ok_or_else(|| ChannelError::Rejected(format!("user {user} is not in chat {chat_id}")))?;
        Ok((record, other))
    }
}

const fn pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a.0 <= b.0 { (a, b) } else { (b, a) }
}

/// Events to deliver once the hub lock is released.
type Outbox = Vec<(UserId, ChannelEvent)>;

#[derive(Debug)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

impl LoopbackHub {
    /// New hub whose first allocated chat id is `first_chat_id`.
    pub fn new(first_chat_id: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                next_id: first_chat_id.max(1),
                ..HubState::default()
            }),
        })
    }

    /// A fresh, unopened channel onto this hub.
    pub fn channel(self: &Arc<Self>) -> LoopbackChannel {
        LoopbackChannel {
            hub: Arc::clone(self),
            user: RwLock::new(None),
        }
    }

    pub async fn chat_status(&self, chat_id: ChatId) -> Option<ServerStatus> {
        self.state.lock().await.chats.get(&chat_id).map(|c| c.status)
    }

    pub async fn registered_key(&self, chat_id: ChatId, user: UserId) -> Option<String> {
        self.state.lock().await.keys.get(&(chat_id, user)).cloned()
    }

    async fn deliver(&self, outbox: Outbox) {
        for (user, event) in outbox {
            let sender = self.state.lock().await.subscribers.get(&user).cloned();
            match sender {
                Some(tx) => {
                    let name = event.name();
                    if tx.send(event).await.is_err() {
                        debug!(user_id = %user, event = name, "Subscriber gone, event dropped");
                    }
                }
                None => debug!(user_id = %user, event = event.name(), "User offline, event dropped"),
            }
        }
    }

    async fn subscribe(&self, user: UserId) -> mpsc::Receiver<ChannelEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.state.lock().await.subscribers.insert(user, tx);
        info!(user_id = %user, "User connected to hub");
        rx
    }

    async fn unsubscribe(&self, user: UserId) {
        self.state.lock().await.subscribers.remove(&user);
    }

    async fn join_chat(&self, request: JoinChatRequest) -> JoinChatResponse {
        let JoinChatRequest {
            user_id: user,
            target_id: target,
            chat_id,
            accepted,
        } = request;
        let mut outbox = Outbox::new();

        let response = {
            let mut state = self.state.lock().await;
            let existing = Some(chat_id)
                .filter(|id| state.chats.get(id).is_some_and(|c| c.other(user) == Some(target)))
                .or_else(|| state.by_pair.get(&pair(user, target)).copied());

            let (id, status) = match existing.and_then(|id| state.chats.get(&id).map(|c| (id, *c))) {
                // A blocked pair that invites again starts a new chat.
                None | Some((_, ChatRecord { status: ServerStatus::Blocked, .. })) if accepted => {
                    let id = state.allocate(user, target, ServerStatus::Pending);
                    outbox.push((target, ChannelEvent::NotifyReceiver { creator_id: user, chat_id: id }));
                    (id, ServerStatus::Pending)
                }
                None => (state.allocate(user, target, ServerStatus::Blocked), ServerStatus::Blocked),
                Some((id, record)) => {
                    let next = match (record.status, accepted) {
                        (ServerStatus::Pending, true) if user == record.creator => {
                            outbox.push((target, ChannelEvent::NotifyReceiver { creator_id: user, chat_id: id }));
                            ServerStatus::Pending
                        }
                        (ServerStatus::Pending, true) => {
                            outbox.push((target, ChannelEvent::NotificationAccepted));
                            ServerStatus::Active
                        }
                        (ServerStatus::Active, true) => ServerStatus::Active,
                        (ServerStatus::Blocked, _) => ServerStatus::Blocked,
                        (ServerStatus::Pending | ServerStatus::Active, false) => {
                            outbox.push((target, ChannelEvent::NotificationRefused));
                            ServerStatus::Blocked
                        }
                    };
                    if let Some(chat) = state.chats.get_mut(&id) {
                        chat.status = next;
                    }
                    (id, next)
                }
            };
            info!(user_id = %user, target_id = %target, chat_id = %id, %status, accepted, "JoinChat");
            JoinChatResponse {
                id,
                status: status.as_str().to_string(),
            }
        };

        self.deliver(outbox).await;
        response
    }

    async fn send_message(&self, user: UserId, chat_id: ChatId, ciphertext: String) -> Result<(), ChannelError> {
        let other = {
            let state = self.state.lock().await;
            let (record, other) = state.member_chat(chat_id, user)?;
            if record.status != ServerStatus::Active {
                return Err(ChannelError::Rejected(format!("chat {chat_id} is {}", record.status)));
            }
            other
        };
        self.deliver(vec![(
            other,
            ChannelEvent::ReceiveMessage {
                sender_id: user,
                ciphertext,
            },
        )])
        .await;
        Ok(())
    }

    async fn register_public_key(&self, user: UserId, public_key: String, chat_id: ChatId) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        state.member_chat(chat_id, user)?;
        state.keys.insert((chat_id, user), public_key);
        debug!(user_id = %user, chat_id = %chat_id, "Public key registered");
        Ok(())
    }

    async fn get_public_keys(&self, user: UserId, chat_id: ChatId) -> Result<PublicKeysResponse, ChannelError> {
        let state = self.state.lock().await;
        let (_, other) = state.member_chat(chat_id, user)?;
        Ok(PublicKeysResponse {
            user_public_key: state.keys.get(&(chat_id, user)).cloned(),
            other_user_public_key: state.keys.get(&(chat_id, other)).cloned(),
        })
    }

    async fn notify_updated_keys(&self, user: UserId, chat_id: ChatId) -> Result<(), ChannelError> {
        let other = {
            let state = self.state.lock().await;
            state.member_chat(chat_id, user)?.1
        };
        self.deliver(vec![(other, ChannelEvent::NotifyUpdatedKeys)]).await;
        Ok(())
    }
}

/// One user's connection to a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackChannel {
    hub: Arc<LoopbackHub>,
    user: RwLock<Option<UserId>>,
}

impl LoopbackChannel {
    async fn caller(&self) -> Result<UserId, ChannelError> {
        (*self.user.read().await).ok_or(ChannelError::NotConnected)
    }
}

#[async_trait]
impl RealtimeChannel for LoopbackChannel {
    async fn open(&self, user_id: UserId) -> Result<mpsc::Receiver<ChannelEvent>, ChannelError> {
        let mut user = self.user.write().await;
        if user.is_some() {
            return Err(ChannelError::AlreadyConnected);
        }
        *user = Some(user_id);
        Ok(self.hub.subscribe(user_id).await)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let user = self.user.write().await.take().ok_or(ChannelError::Closed)?;
        self.hub.unsubscribe(user).await;
        Ok(())
    }

    async fn join_chat(&self, request: JoinChatRequest) -> Result<JoinChatResponse, ChannelError> {
        let caller = self.caller().await?;
        if caller != request.user_id {
            return Err(ChannelError::Rejected("JoinChat on behalf of another user".into()));
        }
        Ok(self.hub.join_chat(request).await)
    }

    async fn send_message(&self, chat_id: ChatId, ciphertext: String) -> Result<(), ChannelError> {
        self.hub.send_message(self.caller().await?, chat_id, ciphertext).await
    }

    async fn register_public_key(&self, public_key: String, chat_id: ChatId) -> Result<(), ChannelError> {
        self.hub
            .register_public_key(self.caller().await?, public_key, chat_id)
            .await
    }

    async fn get_public_keys(&self, chat_id: ChatId) -> Result<PublicKeysResponse, ChannelError> {
        self.hub.get_public_keys(self.caller().await?, chat_id).await
    }

    async fn notify_updated_keys(&self, chat_id: ChatId) -> Result<(), ChannelError> {
        self.hub.notify_updated_keys(self.caller().await?, chat_id).await
    }
}
