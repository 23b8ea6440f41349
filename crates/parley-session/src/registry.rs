//! In-memory registry of conversation state.

use std::collections::HashMap;

use parley_crypto::PublicKeyBytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{ChatId, Conversation, SessionState, UserId};
use crate::reducer::{SessionEvent, normalize, reduce};

/// Partial update for [`SessionRegistry::update`]. The conversation is
/// replaced whole; keys are merged (`None` keeps the current value).
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub conversation: Option<Conversation>,
    pub my_public_key: Option<PublicKeyBytes>,
    pub counterpart_public_key: Option<PublicKeyBytes>,
}

/// Authoritative map `chatId -> SessionState`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ChatId, SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `state` unless its chat id is already known. Returns the state
    /// now held for that id.
    pub async fn init(&self, state: SessionState) -> SessionState {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(state.chat_id())
            .or_insert_with(|| normalize(state))
            .clone()
    }

    pub async fn get(&self, chat_id: ChatId) -> Option<SessionState> {
        self.sessions.read().await.get(&chat_id).cloned()
    }

    pub async fn contains(&self, chat_id: ChatId) -> bool {
        self.sessions.read().await.contains_key(&chat_id)
    }

    /// Find the conversation held with `counterpart`, if any.
    pub async fn find_by_counterpart(&self, counterpart: UserId) -> Option<SessionState> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.conversation.counterpart_id == counterpart)
            .cloned()
    }

    pub async fn update(&self, chat_id: ChatId, patch: SessionPatch) -> Option<SessionState> {
        let mut sessions = self.sessions.write().await;
        let current = sessions.get_mut(&chat_id)?;
        let mut next = current.clone();
        if let Some(conversation) = patch.conversation {
            next.conversation = conversation;
        }
        if patch.my_public_key.is_some() {
            next.my_public_key = patch.my_public_key;
        }
        if patch.counterpart_public_key.is_some() {
            next.counterpart_public_key = patch.counterpart_public_key;
        }
        *current = normalize(next);
        Some(current.clone())
    }

    /// Run the reducer on the state held for `chat_id`.
    pub async fn apply(&self, chat_id: ChatId, event: SessionEvent) -> Option<SessionState> {
        if let SessionEvent::IdReassigned { new_id } = event {
            let current = self.get(chat_id).await?;
            return Some(self.reassign_id(chat_id, new_id, current).await);
        }

        let mut sessions = self.sessions.write().await;
        let current = sessions.get_mut(&chat_id)?;
        let before = current.conversation.status;
        *current = reduce(current.clone(), event);
        debug!(
            chat_id = %chat_id,
            event = event.name(),
            from = %before,
            to = %current.conversation.status,
            "Session transition"
        );
        Some(current.clone())
    }

    /// Move a conversation to the server's canonical id. The old entry is
    /// removed and `new_state` (keys merged with the old entry) inserted under
    /// `new_id` under one write lock.
    pub async fn reassign_id(&self, old_id: ChatId, new_id: ChatId, new_state: SessionState) -> SessionState {
        let mut sessions = self.sessions.write().await;
        let old = sessions.remove(&old_id);

        let mut merged = reduce(new_state, SessionEvent::IdReassigned { new_id });
        if let Some(old) = old {
            merged.my_public_key = merged.my_public_key.or(old.my_public_key);
            merged.counterpart_public_key = merged.counterpart_public_key.or(old.counterpart_public_key);
        }
        let merged = normalize(merged);
        sessions.insert(new_id, merged.clone());
        debug!(old_id = %old_id, new_id = %new_id, "Chat id reassigned");
        merged
    }

    pub async fn remove(&self, chat_id: ChatId) -> Option<SessionState> {
        self.sessions.write().await.remove(&chat_id)
    }

    pub async fn all(&self) -> Vec<SessionState> {
        let mut states: Vec<_> = self.sessions.read().await.values().cloned().collect();
        states.sort_by_key(SessionState::chat_id);
        states
    }

    pub async fn clear(&self) {
        self.sessions.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{ChatStatus, ServerStatus};
    use parley_crypto::ConversationKeyPair;

    fn state(chat: u64) -> SessionState {
        SessionState::new(Conversation::new(ChatId(chat), UserId(2), "bob"))
    }

    fn key() -> PublicKeyBytes {
        ConversationKeyPair::generate().public_key()
    }

    #[tokio::test]
    async fn init_does_not_overwrite() {
        let registry = SessionRegistry::new();
        registry.init(state(5)).await;

        let mut other = state(5);
        other.conversation.counterpart_name = "mallory".into();
        let held = registry.init(other).await;
        assert_eq!(held.conversation.counterpart_name, "bob");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn update_replaces_conversation_and_merges_keys() {
        let registry = SessionRegistry::new();
        registry.init(state(5)).await;
        let mine = key();
        registry
            .update(
                ChatId(5),
                SessionPatch {
                    my_public_key: Some(mine),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        let mut conversation = Conversation::new(ChatId(5), UserId(2), "robert");
        conversation.status = ChatStatus::Invited;
        let updated = registry
            .update(
                ChatId(5),
                SessionPatch {
                    conversation: Some(conversation.clone()),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.conversation, conversation);
        assert_eq!(updated.my_public_key, Some(mine));
    }

    #[tokio::test]
    async fn update_cannot_force_inconsistent_active() {
        let registry = SessionRegistry::new();
        registry.init(state(5)).await;
        let mut conversation = Conversation::new(ChatId(5), UserId(2), "bob");
        conversation.status = ChatStatus::Active;
        let updated = registry
            .update(
                ChatId(5),
                SessionPatch {
                    conversation: Some(conversation),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status(), ChatStatus::Invited);
    }

    #[tokio::test]
    async fn apply_on_unknown_chat_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.apply(ChatId(1), SessionEvent::InviteAccepted).await.is_none());
    }

    #[tokio::test]
    async fn reassign_moves_entry_and_keeps_keys() {
        let registry = SessionRegistry::new();
        let mine = key();
        let mut initial = state(0);
        initial.my_public_key = Some(mine);
        registry.init(initial).await;

        let current = registry.get(ChatId(0)).await.unwrap();
        let moved = registry
            .apply(ChatId(0), SessionEvent::IdReassigned { new_id: ChatId(5) })
            .await
            .unwrap();
        assert_eq!(moved.chat_id(), ChatId(5));
        assert_eq!(moved.my_public_key, current.my_public_key);
        assert!(registry.get(ChatId(0)).await.is_none());
        assert_eq!(registry.get(ChatId(5)).await.unwrap(), moved);
    }

    #[tokio::test]
    async fn reassign_with_replacement_state() {
        let registry = SessionRegistry::new();
        registry.init(state(3)).await;

        let replacement = reduce(
            state(3),
            SessionEvent::InviteSent {
                server_status: ServerStatus::Pending,
            },
        );
        let moved = registry.reassign_id(ChatId(3), ChatId(5), replacement).await;
        assert_eq!(moved.status(), ChatStatus::Invited);
        assert_eq!(registry.all().await.len(), 1);
    }

    #[tokio::test]
    async fn find_by_counterpart_and_clear() {
        let registry = SessionRegistry::new();
        registry.init(state(5)).await;
        assert!(registry.find_by_counterpart(UserId(2)).await.is_some());
        assert!(registry.find_by_counterpart(UserId(3)).await.is_none());

        registry.clear().await;
        assert!(registry.is_empty().await);
    }
}
