//! Per-process expiry timer.
//!
//! Tracks an `expires_at` deadline per conversation and, on every tick,
//! hands conversations whose deadline has passed to an [`ExpiryHandler`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::clock::{Clock, deadline_after};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::model::ChatId;

/// Receives conversations whose deadline passed.
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    /// Returns `false` if the conversation could not be expired now. It is
    /// tracked again and retried on the next tick.
    async fn handle_expiry(&self, chat_id: ChatId) -> bool;
}

pub struct ExpirationScheduler {
    deadlines: Mutex<HashMap<ChatId, i64>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ExpirationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationScheduler").finish_non_exhaustive()
    }
}

impl ExpirationScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            deadlines: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Start tracking `chat_id` with an explicit deadline (a new key was
    /// persisted). Replaces any previous deadline.
    pub async fn track(&self, chat_id: ChatId, expires_at: i64) {
        self.deadlines.lock().await.insert(chat_id, expires_at);
        debug!(chat_id = %chat_id, expires_at, "Tracking conversation expiry");
    }

    /// Push the deadline to `now + ttl`. Never moves it backward. Returns
    /// the resulting deadline, or `None` if `chat_id` is not tracked.
    pub async fn renew(&self, chat_id: ChatId, ttl: Duration) -> Option<i64> {
        let candidate = deadline_after(self.clock.now_millis(), ttl);
        let mut deadlines = self.deadlines.lock().await;
        let deadline = deadlines.get_mut(&chat_id)?;
        *deadline = (*deadline).max(candidate);
        Some(*deadline)
    }

    pub async fn untrack(&self, chat_id: ChatId) {
        self.deadlines.lock().await.remove(&chat_id);
    }

    pub async fn clear(&self) {
        self.deadlines.lock().await.clear();
    }

    pub async fn deadline(&self, chat_id: ChatId) -> Option<i64> {
        self.deadlines.lock().await.get(&chat_id).copied()
    }

    /// Remove and return every conversation with `now > expires_at`.
    pub async fn due(&self) -> Vec<ChatId> {
        self.take_due().await.into_iter().map(|(chat_id, _)| chat_id).collect()
    }

    async fn take_due(&self) -> Vec<(ChatId, i64)> {
        let now = self.clock.now_millis();
        let mut deadlines = self.deadlines.lock().await;
        let mut expired: Vec<(ChatId, i64)> = deadlines
            .iter()
            .filter(|&(_, &expires_at)| now > expires_at)
            .map(|(&chat_id, &expires_at)| (chat_id, expires_at))
            .collect();
        for (chat_id, _) in &expired {
            deadlines.remove(chat_id);
        }
        expired.sort_unstable();
        expired
    }

    /// One timer tick: expire everything that is due. Returns the
    /// conversations the handler expired; the rest stay tracked.
    pub async fn tick(&self, handler: &dyn ExpiryHandler) -> Vec<ChatId> {
        let mut expired = Vec::new();
        for (chat_id, expires_at) in self.take_due().await {
            info!(chat_id = %chat_id, "Conversation deadline passed");
            if handler.handle_expiry(chat_id).await {
                expired.push(chat_id);
            } else {
                // A deadline set while the handler ran wins.
                self.deadlines.lock().await.entry(chat_id).or_insert(expires_at);
                debug!(chat_id = %chat_id, expires_at, "Expiry retried on next tick");
            }
        }
        expired
    }

    /// Run [`tick`](Self::tick) every `interval` until the handle is stopped
    /// or the handler is dropped.
    pub fn spawn<H>(self: &Arc<Self>, handler: &Arc<H>, interval: Duration) -> SchedulerHandle
    where
        H: ExpiryHandler + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let handler: Weak<H> = Arc::downgrade(handler);

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let Some(handler) = handler.upgrade() else {
                            debug!("Expiry handler dropped, scheduler exiting");
                            return;
                        };
                        scheduler.tick(handler.as_ref()).await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Expiration scheduler shutting down");
                        return;
                    }
                }
            }
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Cancellable handle to the spawned timer.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the timer task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parley_core::clock::ManualClock;

    #[derive(Default)]
    struct Recorder {
        expired: Mutex<Vec<ChatId>>,
        /// Number of calls to turn down before accepting.
        refusals: Mutex<u32>,
    }

    #[async_trait]
    impl ExpiryHandler for Recorder {
        async fn handle_expiry(&self, chat_id: ChatId) -> bool {
            let mut refusals = self.refusals.lock().await;
            if *refusals > 0 {
                *refusals -= 1;
                return false;
            }
            self.expired.lock().await.push(chat_id);
            true
        }
    }

    fn setup() -> (Arc<ExpirationScheduler>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (Arc::new(ExpirationScheduler::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn expires_strictly_after_deadline() {
        let (scheduler, clock) = setup();
        let recorder = Recorder::default();
        scheduler.track(ChatId(5), 120_000).await;

        clock.set(120_000);
        assert!(scheduler.tick(&recorder).await.is_empty());

        clock.set(120_001);
        assert_eq!(scheduler.tick(&recorder).await, vec![ChatId(5)]);
        assert_eq!(*recorder.expired.lock().await, vec![ChatId(5)]);

        // Fired once, then forgotten.
        assert!(scheduler.tick(&recorder).await.is_empty());
        assert_eq!(scheduler.deadline(ChatId(5)).await, None);
    }

    #[tokio::test]
    async fn refused_expiry_is_retried_next_tick() {
        let (scheduler, clock) = setup();
        let recorder = Recorder {
            refusals: Mutex::new(1),
            ..Recorder::default()
        };
        scheduler.track(ChatId(5), 10).await;
        clock.set(11);

        assert!(scheduler.tick(&recorder).await.is_empty());
        assert_eq!(scheduler.deadline(ChatId(5)).await, Some(10));

        assert_eq!(scheduler.tick(&recorder).await, vec![ChatId(5)]);
        assert_eq!(*recorder.expired.lock().await, vec![ChatId(5)]);
        assert_eq!(scheduler.deadline(ChatId(5)).await, None);
    }

    #[tokio::test]
    async fn renew_is_monotonic() {
        let (scheduler, clock) = setup();
        scheduler.track(ChatId(5), 120_000).await;

        clock.set(60_000);
        assert_eq!(scheduler.renew(ChatId(5), Duration::from_secs(120)).await, Some(180_000));
        assert_eq!(scheduler.renew(ChatId(5), Duration::from_secs(1)).await, Some(180_000));
        assert_eq!(scheduler.renew(ChatId(9), Duration::from_secs(120)).await, None);
    }

    #[tokio::test]
    async fn untrack_and_clear() {
        let (scheduler, clock) = setup();
        scheduler.track(ChatId(5), 10).await;
        scheduler.track(ChatId(6), 10).await;
        scheduler.untrack(ChatId(5)).await;
        clock.set(11);
        assert_eq!(scheduler.due().await, vec![ChatId(6)]);

        scheduler.track(ChatId(7), 10).await;
        scheduler.clear().await;
        assert!(scheduler.due().await.is_empty());
    }

    #[tokio::test]
    async fn spawned_timer_fires_and_stops() {
        let (scheduler, clock) = setup();
        let recorder = Arc::new(Recorder::default());
        scheduler.track(ChatId(5), 10).await;
        clock.set(11);

        let handle = scheduler.spawn(&recorder, Duration::from_millis(5));
        for _ in 0..100 {
            if !recorder.expired.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*recorder.expired.lock().await, vec![ChatId(5)]);

        handle.stop().await;
    }

    #[tokio::test]
    async fn timer_exits_when_handler_is_dropped() {
        let (scheduler, _) = setup();
        let recorder = Arc::new(Recorder::default());
        let handle = scheduler.spawn(&recorder, Duration::from_millis(5));
        drop(recorder);

        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.is_finished());
    }
}
