//! Encrypted message history, one list per conversation.

use std::sync::Arc;

use parley_core::clock::Clock;
use parley_core::kv::{KeyValueStore, Namespace, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::model::{ChatId, Direction, EncryptedMessage, KeyOwner};

fn history_key(chat_id: ChatId) -> String {
    format!("chat_{chat_id}")
}

/// Append-only message log kept in the `messages` namespace.
pub struct MessageHistory {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for MessageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHistory").finish_non_exhaustive()
    }
}

impl MessageHistory {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one message. Ids are strictly increasing per conversation.
    pub async fn append(
        &self,
        chat_id: ChatId,
        direction: Direction,
        ciphertext: String,
        encrypted_under: KeyOwner,
    ) -> Result<EncryptedMessage, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut messages = self.load(chat_id).await?;

        let now = self.clock.now_millis();
        let id = messages.last().map_or(now, |last| now.max(last.id + 1));
        let message = EncryptedMessage {
            id,
            direction,
            ciphertext,
            encrypted_under,
            received_at: now,
        };
        messages.push(message.clone());
        self.save(chat_id, &messages).await?;
        debug!(chat_id = %chat_id, message_id = id, ?direction, "Message appended");
        Ok(message)
    }

    /// All messages for `chat_id`, ascending by id.
    pub async fn load(&self, chat_id: ChatId) -> Result<Vec<EncryptedMessage>, StoreError> {
        let Some(bytes) = self.store.get(Namespace::Messages, &history_key(chat_id)).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_slice(&bytes) {
            Ok(messages) => Ok(messages),
            Err(e) => {
                error!(chat_id = %chat_id, error = %e, "Message history is unreadable");
                Err(StoreError::Query(format!("corrupt history for chat {chat_id}: {e}")))
            }
        }
    }

    pub async fn clear(&self, chat_id: ChatId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store
            .delete(Namespace::Messages, &history_key(chat_id))
            .await
    }

    async fn save(&self, chat_id: ChatId, messages: &[EncryptedMessage]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(messages).map_err(|e| StoreError::Query(e.to_string()))?;
        self.store
            .put(Namespace::Messages, &history_key(chat_id), bytes)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parley_core::clock::ManualClock;
    use parley_core::kv::MemoryStore;
    use std::time::Duration;

    fn setup() -> (MessageHistory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let history = MessageHistory::new(Arc::new(MemoryStore::new()), clock.clone());
        (history, clock)
    }

    #[tokio::test]
    async fn ids_are_strictly_monotonic_under_a_frozen_clock() {
        let (history, _) = setup();
        let chat = ChatId(5);
        for n in 0..3 {
            history
                .append(chat, Direction::Inbound, format!("c{n}"), KeyOwner::Own)
                .await
                .unwrap();
        }
        let ids: Vec<_> = history.load(chat).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![10_000, 10_001, 10_002]);
    }

    #[tokio::test]
    async fn arrival_order_is_kept() {
        let (history, clock) = setup();
        let chat = ChatId(5);
        history
            .append(chat, Direction::Outbound, "first".into(), KeyOwner::Own)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1));
        history
            .append(chat, Direction::Inbound, "second".into(), KeyOwner::Own)
            .await
            .unwrap();

        let loaded = history.load(chat).await.unwrap();
        assert_eq!(loaded[0].ciphertext, "first");
        assert_eq!(loaded[1].ciphertext, "second");
        assert_eq!(loaded[1].id, 11_000);
    }

    #[tokio::test]
    async fn clear_is_per_conversation() {
        let (history, _) = setup();
        history
            .append(ChatId(5), Direction::Inbound, "a".into(), KeyOwner::Own)
            .await
            .unwrap();
        history
            .append(ChatId(6), Direction::Inbound, "b".into(), KeyOwner::Own)
            .await
            .unwrap();

        history.clear(ChatId(5)).await.unwrap();
        assert!(history.load(ChatId(5)).await.unwrap().is_empty());
        assert_eq!(history.load(ChatId(6)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let (history, _) = setup();
        let history = Arc::new(history);
        let mut handles = Vec::new();
        for n in 0..10 {
            let history = Arc::clone(&history);
            handles.push(tokio::spawn(async move {
                history
                    .append(ChatId(5), Direction::Inbound, format!("m{n}"), KeyOwner::Own)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let loaded = history.load(ChatId(5)).await.unwrap();
        assert_eq!(loaded.len(), 10);
        assert!(loaded.windows(2).all(|w| w[0].id < w[1].id));
    }
}
