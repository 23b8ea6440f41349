//! Handshake state machine.
//!
//! `KeyExchangeCoordinator` is the only writer of the [`SessionRegistry`].
//! It turns user actions and realtime events into reducer steps, key store
//! calls and outbound RPCs. Operations on one conversation never overlap:
//! a second call while one is mid-flight is rejected, not queued.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::clock::Clock;
use parley_core::config::{Config, DEFAULT_KEY_TTL_SECS, DEFAULT_PBKDF2_ITERATIONS};
use parley_core::kv::KeyValueStore;
use parley_crypto::{Ciphertext, ConversationKeyPair, KeyLookup, KeyStore, MessageCodec, PublicKeyBytes};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::channel::{ChannelError, ChannelEvent, JoinChatRequest, JoinChatResponse};
use crate::connection::ConnectionManager;
use crate::error::{Result, SessionError};
use crate::history::MessageHistory;
use crate::model::{
    ChatId, ChatStatus, Conversation, ConversationSummary, Direction, EncryptedMessage, KeyOwner, MessageBody,
    PendingInvitation, RenderedMessage, ServerStatus, SessionState, UserId,
};
use crate::reducer::{SessionEvent, reduce};
use crate::registry::SessionRegistry;
use crate::scheduler::{ExpirationScheduler, ExpiryHandler, SchedulerHandle};

/// Tunables for the key exchange.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub key_ttl: Duration,
    pub pbkdf2_iterations: u32,
    pub register_attempts: u32,
    /// Base delay of the linear `RegisterPublicKey` backoff.
    pub register_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_ttl: Duration::from_secs(DEFAULT_KEY_TTL_SECS),
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            register_attempts: 3,
            register_backoff: Duration::from_millis(200),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            key_ttl: config.keys.ttl(),
            pbkdf2_iterations: config.keys.pbkdf2_iterations,
            register_attempts: config.keys.register_attempts,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GuardKey {
    Chat(ChatId),
    /// Used while the canonical chat id is not known yet.
    Counterpart(UserId),
}

/// Releases its keys from the in-flight set on drop.
struct InFlight<'a> {
    set: &'a StdMutex<HashSet<GuardKey>>,
    keys: Vec<GuardKey>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            set.remove(key);
        }
    }
}

fn unknown_chat(chat_id: ChatId) -> SessionError {
    SessionError::InvalidStateTransition(format!("unknown chat {chat_id}"))
}

fn parse_reply(reply: &JoinChatResponse) -> Result<(ChatId, ServerStatus)> {
    if !reply.id.is_assigned() {
        return Err(ChannelError::Rejected("JoinChat returned no chat id".into()).into());
    }
    let status = reply.status.parse::<ServerStatus>().map_err(ChannelError::Rejected)?;
    Ok((reply.id, status))
}

pub struct KeyExchangeCoordinator {
    me: UserId,
    connection: Arc<ConnectionManager>,
    registry: SessionRegistry,
    keystore: KeyStore,
    history: MessageHistory,
    scheduler: Arc<ExpirationScheduler>,
    clock: Arc<dyn Clock>,
    password: Zeroizing<String>,
    config: CoordinatorConfig,
    in_flight: StdMutex<HashSet<GuardKey>>,
    invitations: RwLock<HashMap<ChatId, PendingInvitation>>,
    active: RwLock<Option<ChatId>>,
    /// Bumped on every change of the active conversation.
    epoch: AtomicU64,
}

impl std::fmt::Debug for KeyExchangeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchangeCoordinator")
            .field("me", &self.me)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KeyExchangeCoordinator {
    pub fn new(
        me: UserId,
        connection: Arc<ConnectionManager>,
        storage: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        password: &str,
        config: CoordinatorConfig,
    ) -> Self {
        let keystore =
            KeyStore::new(Arc::clone(&storage), Arc::clone(&clock)).with_iterations(config.pbkdf2_iterations);
        Self {
            me,
            connection,
            registry: SessionRegistry::new(),
            keystore,
            history: MessageHistory::new(storage, Arc::clone(&clock)),
            scheduler: Arc::new(ExpirationScheduler::new(Arc::clone(&clock))),
            clock,
            password: Zeroizing::new(password.to_owned()),
            config,
            in_flight: StdMutex::new(HashSet::new()),
            invitations: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub const fn me(&self) -> UserId {
        self.me
    }

    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub const fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    pub const fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub const fn scheduler(&self) -> &Arc<ExpirationScheduler> {
        &self.scheduler
    }

    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    fn try_begin(&self, keys: &[GuardKey]) -> Result<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = keys.iter().find(|k| set.contains(k)) {
            debug!(?busy, "Operation already in flight");
            return Err(SessionError::InvalidStateTransition(format!(
                "operation already in flight for {busy:?}"
            )));
        }
        set.extend(keys.iter().copied());
        Ok(InFlight {
            set: &self.in_flight,
            keys: keys.to_vec(),
        })
    }

    async fn current(&self, chat_id: ChatId) -> Result<SessionState> {
        self.registry.get(chat_id).await.ok_or_else(|| unknown_chat(chat_id))
    }

    // --- Connection lifecycle ---

    /// Connect as `me` and start dispatching inbound events.
    pub async fn connect(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let events = self.connection.connect(self.me).await?;
        Ok(self.spawn_event_pump(events))
    }

    /// Drive [`handle_event`](Self::handle_event) until the stream closes.
    pub fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::Receiver<ChannelEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_event(event).await;
            }
            debug!(user_id = %this.me, "Event stream closed");
        })
    }

    /// Start the per-process expiry timer.
    pub fn spawn_scheduler(self: &Arc<Self>, interval: Duration) -> SchedulerHandle {
        self.scheduler.spawn(self, interval)
    }

    // --- Active conversation ---

    pub async fn active_conversation(&self) -> Option<ChatId> {
        *self.active.read().await
    }

    /// Make `chat_id` the active conversation. In-flight renders for the
    /// previous one will drop their results.
    pub async fn switch_to(&self, chat_id: Option<ChatId>) {
        let mut active = self.active.write().await;
        if *active != chat_id {
            *active = chat_id;
            self.epoch.fetch_add(1, Ordering::SeqCst);
            debug!(chat_id = ?chat_id.map(ChatId::get), "Active conversation switched");
        }
    }

    /// Register a conversation from the conversation list and make it active.
    pub async fn open_conversation(&self, summary: ConversationSummary) -> Result<SessionState> {
        let chat_id = summary.chat_id;
        let state = self.registry.init(SessionState::from_summary(&summary)).await;
        self.switch_to(Some(chat_id)).await;
        if !chat_id.is_assigned() || state.status().is_terminal() {
            return Ok(state);
        }

        match self.keystore.lookup(chat_id.get(), &self.password).await? {
            KeyLookup::Found(keypair) => {
                if let Some(expires_at) = self.keystore.expires_at(chat_id.get()).await? {
                    self.scheduler.track(chat_id, expires_at).await;
                }
                self.registry
                    .apply(
                        chat_id,
                        SessionEvent::KeysLoaded {
                            mine: Some(keypair.public_key()),
                            theirs: None,
                        },
                    )
                    .await;
            }
            KeyLookup::Expired => {
                self.on_expire(chat_id).await?;
                return self.current(chat_id).await;
            }
            KeyLookup::Absent => debug!(chat_id = %chat_id, "No stored key for conversation"),
            KeyLookup::Undecryptable => {
                warn!(chat_id = %chat_id, "CryptoFailure: stored key for conversation cannot be unwrapped");
            }
        }

        if state.conversation.handshake_confirmed {
            if let Err(e) = self.refresh_keys(chat_id).await {
                warn!(chat_id = %chat_id, error = %e, "Could not load public keys");
            }
        }
        self.current(chat_id).await
    }

    // --- Handshake ---

    /// Invite `counterpart`, or accept their invite. The server's chat id
    /// replaces whatever id was held locally.
    pub async fn send_invite(&self, counterpart: UserId, existing: Option<ChatId>) -> Result<SessionState> {
        let existing = existing.unwrap_or(ChatId::UNASSIGNED);
        let mut guard_keys = vec![GuardKey::Counterpart(counterpart)];
        if existing.is_assigned() {
            guard_keys.push(GuardKey::Chat(existing));
        }
        let _guard = self.try_begin(&guard_keys)?;

        let reply = self
            .connection
            .join_chat(JoinChatRequest {
                user_id: self.me,
                target_id: counterpart,
                chat_id: existing,
                accepted: true,
            })
            .await?;
        let (chat_id, server_status) = parse_reply(&reply)?;
        let _canonical_guard = if chat_id == existing {
            None
        } else {
            Some(self.try_begin(&[GuardKey::Chat(chat_id)])?)
        };
        info!(
            counterpart_id = %counterpart,
            requested_chat_id = %existing,
            chat_id = %chat_id,
            %server_status,
            "Invite sent"
        );

        let prior = match self.registry.get(existing).await {
            Some(state) => Some(state),
            None => self.registry.find_by_counterpart(counterpart).await,
        };
        let event = SessionEvent::InviteSent { server_status };
        let state = match prior {
            Some(prior) if prior.chat_id() == chat_id => {
                self.registry.apply(chat_id, event).await.ok_or_else(|| unknown_chat(chat_id))?
            }
            Some(prior) => {
                let old_id = prior.chat_id();
                let moved = self.registry.reassign_id(old_id, chat_id, reduce(prior, event)).await;
                self.scheduler.untrack(old_id).await;
                self.keystore.purge(old_id.get()).await?;
                self.dismiss_invitation(old_id).await;
                moved
            }
            None => {
                let conversation = Conversation::new(chat_id, counterpart, counterpart.to_string());
                self.registry
                    .init(reduce(SessionState::new(conversation), event))
                    .await
            }
        };
        self.dismiss_invitation(chat_id).await;
        self.switch_to(Some(chat_id)).await;

        if server_status == ServerStatus::Blocked {
            info!(chat_id = %chat_id, "Server reports chat blocked");
            return Ok(state);
        }

        let (_, state) = self.install_fresh_key(chat_id).await?;
        if server_status == ServerStatus::Active {
            self.connection.notify_updated_keys(chat_id).await?;
            return self.refresh_keys(chat_id).await;
        }
        Ok(state)
    }

    /// Decline `counterpart`'s invite. Keys are left alone.
    pub async fn refuse(&self, counterpart: UserId, chat_id: ChatId) -> Result<SessionState> {
        let _guard = self.try_begin(&[GuardKey::Chat(chat_id), GuardKey::Counterpart(counterpart)])?;

        let reply = self
            .connection
            .join_chat(JoinChatRequest {
                user_id: self.me,
                target_id: counterpart,
                chat_id,
                accepted: false,
            })
            .await?;
        let (canonical, server_status) = parse_reply(&reply)?;
        if server_status != ServerStatus::Blocked {
            warn!(chat_id = %canonical, %server_status, "Server did not block refused chat");
        }

        match self.registry.get(chat_id).await {
            Some(prior) if canonical != chat_id => {
                self.registry.reassign_id(chat_id, canonical, prior).await;
            }
            Some(_) => {}
            None => {
                let conversation = Conversation::new(canonical, counterpart, counterpart.to_string());
                self.registry.init(SessionState::new(conversation)).await;
            }
        }
        let state = self
            .registry
            .apply(canonical, SessionEvent::InviteRefused)
            .await
            .ok_or_else(|| unknown_chat(canonical))?;

        self.dismiss_invitation(chat_id).await;
        self.dismiss_invitation(canonical).await;
        info!(chat_id = %canonical, counterpart_id = %counterpart, "Invite refused");
        Ok(state)
    }

    /// Generate, persist and register a new key pair for `chat_id`. The key
    /// is only recorded in the session once the server has it.
    async fn install_fresh_key(&self, chat_id: ChatId) -> Result<(ConversationKeyPair, SessionState)> {
        let keypair = KeyStore::generate();
        let public = keypair.public_key();
        let expires_at = self
            .keystore
            .persist(chat_id.get(), &keypair, &self.password, self.config.key_ttl)
            .await?;

        if let Err(e) = self
            .connection
            .register_public_key_with_retry(
                &public.to_base64(),
                chat_id,
                self.config.register_attempts,
                self.config.register_backoff,
            )
            .await
        {
            warn!(chat_id = %chat_id, error = %e, "Public key registration failed, discarding key");
            self.keystore.purge(chat_id.get()).await?;
            return Err(e.into());
        }

        self.scheduler.track(chat_id, expires_at).await;
        info!(chat_id = %chat_id, fingerprint = %public.fingerprint(), expires_at, "Conversation key installed");
        let state = self
            .registry
            .apply(
                chat_id,
                SessionEvent::KeysLoaded {
                    mine: Some(public),
                    theirs: None,
                },
            )
            .await
            .ok_or_else(|| unknown_chat(chat_id))?;
        Ok((keypair, state))
    }

    /// Fetch both public keys from the server into the session.
    async fn refresh_keys(&self, chat_id: ChatId) -> Result<SessionState> {
        let keys = self.connection.get_public_keys(chat_id).await?;
        let theirs = keys
            .other_user_public_key
            .as_deref()
            .map(PublicKeyBytes::from_base64)
            .transpose()?;
        let mine = self.keystore.public_key(chat_id.get()).await?;

        if let (Some(server), Some(local)) = (keys.user_public_key.as_deref(), mine) {
            if server != local.to_base64() {
                warn!(chat_id = %chat_id, "Server holds a different public key for this client");
            }
        }

        let state = self
            .registry
            .apply(chat_id, SessionEvent::KeysLoaded { mine, theirs })
            .await
            .ok_or_else(|| unknown_chat(chat_id))?;
        info!(
            chat_id = %chat_id,
            status = %state.status(),
            counterpart_fingerprint = ?theirs.map(|k| k.fingerprint()),
            "Public keys refreshed"
        );
        Ok(state)
    }

    // --- Inbound events ---

    /// Record an invitation. No state changes until the user acts.
    pub async fn on_notify_receiver(&self, creator_id: UserId, chat_id: ChatId) {
        if let Some(state) = self.registry.get(chat_id).await {
            if state.conversation.accepted_by_me {
                debug!(chat_id = %chat_id, "Invitation for a chat already accepted, ignoring");
                return;
            }
        }
        let invitation = PendingInvitation {
            creator_id,
            chat_id,
            received_at: self.clock.now_millis(),
        };
        self.invitations.write().await.insert(chat_id, invitation);
        info!(creator_id = %creator_id, chat_id = %chat_id, "Invitation received");
    }

    pub async fn pending_invitations(&self) -> Vec<PendingInvitation> {
        let mut invitations: Vec<_> = self.invitations.read().await.values().copied().collect();
        invitations.sort_by_key(|i| (i.received_at, i.chat_id));
        invitations
    }

    pub async fn dismiss_invitation(&self, chat_id: ChatId) -> Option<PendingInvitation> {
        self.invitations.write().await.remove(&chat_id)
    }

    /// The counterpart accepted: confirm the handshake and load keys.
    pub async fn on_notification_accepted(&self) -> Result<Option<SessionState>> {
        let Some(chat_id) = self.active_conversation().await else {
            debug!("NotificationAccepted without an active conversation");
            return Ok(None);
        };
        let Some(state) = self.registry.apply(chat_id, SessionEvent::InviteAccepted).await else {
            return Ok(None);
        };
        if state.status().is_terminal() {
            return Ok(Some(state));
        }
        info!(chat_id = %chat_id, "Invite accepted by counterpart");
        self.refresh_keys(chat_id).await.map(Some)
    }

    /// The counterpart refused: `Blocked`, whatever I had accepted.
    pub async fn on_notify_refused(&self) -> Result<Option<SessionState>> {
        let Some(chat_id) = self.active_conversation().await else {
            return Ok(None);
        };
        let state = self.registry.apply(chat_id, SessionEvent::InviteRefused).await;
        info!(chat_id = %chat_id, "Invite refused by counterpart");
        Ok(state)
    }

    /// The counterpart rotated its key.
    pub async fn on_notify_updated_keys(&self) -> Result<Option<SessionState>> {
        let Some(chat_id) = self.active_conversation().await else {
            return Ok(None);
        };
        match self.registry.get(chat_id).await {
            Some(state) if !state.status().is_terminal() => self.refresh_keys(chat_id).await.map(Some),
            other => Ok(other),
        }
    }

    /// Append an inbound message to the active conversation's history.
    /// Messages from anyone but its counterpart are ignored.
    pub async fn on_receive_message(
        &self,
        sender_id: UserId,
        ciphertext: String,
    ) -> Result<Option<EncryptedMessage>> {
        let Some(chat_id) = self.active_conversation().await else {
            return Ok(None);
        };
        let Some(state) = self.registry.get(chat_id).await else {
            return Ok(None);
        };
        if state.conversation.counterpart_id != sender_id {
            debug!(chat_id = %chat_id, sender_id = %sender_id, "Ignoring message from non-counterpart");
            return Ok(None);
        }
        if state.status().is_terminal() {
            debug!(chat_id = %chat_id, status = %state.status(), "Ignoring message for ended conversation");
            return Ok(None);
        }

        let message = self
            .history
            .append(chat_id, Direction::Inbound, ciphertext, KeyOwner::Own)
            .await?;
        if let Ok(_guard) = self.try_begin(&[GuardKey::Chat(chat_id)]) {
            self.renew(chat_id).await;
        }
        Ok(Some(message))
    }

    /// Dispatch one realtime event. Failures are logged, never returned.
    pub async fn handle_event(&self, event: ChannelEvent) {
        let name = event.name();
        let result = match event {
            ChannelEvent::NotifyReceiver { creator_id, chat_id } => {
                self.on_notify_receiver(creator_id, chat_id).await;
                Ok(())
            }
            ChannelEvent::NotificationAccepted => self.on_notification_accepted().await.map(drop),
            ChannelEvent::NotificationRefused => self.on_notify_refused().await.map(drop),
            ChannelEvent::NotifyUpdatedKeys => self.on_notify_updated_keys().await.map(drop),
            ChannelEvent::ReceiveMessage { sender_id, ciphertext } => {
                self.on_receive_message(sender_id, ciphertext).await.map(drop)
            }
        };
        if let Err(e) = result {
            warn!(user_id = %self.me, event = name, error = %e, "Event handling failed");
        }
    }

    // --- Messaging ---

    /// Seal `plaintext` for the counterpart, send it, and keep a
    /// self-readable copy in history.
    pub async fn send_message(&self, chat_id: ChatId, plaintext: &str) -> Result<EncryptedMessage> {
        let _guard = self.try_begin(&[GuardKey::Chat(chat_id)])?;
        let state = self.current(chat_id).await?;
        if state.status() != ChatStatus::Active {
            return Err(SessionError::InvalidStateTransition(format!(
                "cannot send in chat {chat_id}: status is {}",
                state.status()
            )));
        }
        let Some(counterpart_key) = state.counterpart_public_key else {
            return Err(SessionError::InvalidStateTransition(format!(
                "incomplete key material for chat {chat_id}"
            )));
        };

        let keypair = match self.keystore.lookup(chat_id.get(), &self.password).await? {
            KeyLookup::Found(keypair) => keypair,
            KeyLookup::Absent => self.rotate_key(chat_id).await?,
            KeyLookup::Expired => {
                self.expire(chat_id).await?;
                return Err(SessionError::KeyExpired(chat_id));
            }
            KeyLookup::Undecryptable => {
                return Err(SessionError::CryptoFailure(format!(
                    "private key for chat {chat_id} cannot be unwrapped"
                )));
            }
        };

        let sealed = MessageCodec::seal_outbound(plaintext, &keypair.public_key(), &counterpart_key)?;
        self.connection
            .send_message(chat_id, sealed.wire.to_base64())
            .await?;
        let status = self.current(chat_id).await?.status();
        if status.is_terminal() {
            warn!(chat_id = %chat_id, %status, "Conversation ended while sending, local copy dropped");
            return Err(SessionError::InvalidStateTransition(format!(
                "chat {chat_id} became {status} while sending"
            )));
        }
        let message = self
            .history
            .append(chat_id, Direction::Outbound, sealed.local.to_base64(), KeyOwner::Own)
            .await?;
        self.renew(chat_id).await;
        debug!(chat_id = %chat_id, message_id = message.id, "Message sent");
        Ok(message)
    }

    async fn rotate_key(&self, chat_id: ChatId) -> Result<ConversationKeyPair> {
        let (keypair, _) = self.install_fresh_key(chat_id).await?;
        self.connection.notify_updated_keys(chat_id).await?;
        info!(chat_id = %chat_id, "Conversation key rotated");
        Ok(keypair)
    }

    /// Extend the conversation's deadline. Caller holds the chat guard.
    async fn renew(&self, chat_id: ChatId) {
        let ttl = self.config.key_ttl;
        self.scheduler.renew(chat_id, ttl).await;
        if let Err(e) = self.keystore.touch(chat_id.get(), ttl).await {
            warn!(chat_id = %chat_id, error = %e, "Could not extend key lifetime");
        }
    }

    /// Decrypt the history of `chat_id`. Returns `None` when the active
    /// conversation changed while decrypting.
    pub async fn render(&self, chat_id: ChatId) -> Result<Option<Vec<RenderedMessage>>> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let messages = self.history.load(chat_id).await?;
        let keypair = self
            .keystore
            .lookup(chat_id.get(), &self.password)
            .await?
            .into_found();

        let rendered: Vec<_> = messages
            .iter()
            .map(|message| RenderedMessage {
                id: message.id,
                direction: message.direction,
                body: decrypt_body(chat_id, message, keypair.as_ref()),
            })
            .collect();

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(chat_id = %chat_id, "Active conversation changed, dropping render");
            return Ok(None);
        }
        Ok(Some(rendered))
    }

    // --- Teardown ---

    /// Expire `chat_id`: purge its key and history. Rejected while another
    /// operation on the conversation is in flight.
    pub async fn on_expire(&self, chat_id: ChatId) -> Result<()> {
        let _guard = self.try_begin(&[GuardKey::Chat(chat_id)])?;
        self.expire(chat_id).await
    }

    /// Caller holds the chat guard.
    async fn expire(&self, chat_id: ChatId) -> Result<()> {
        self.scheduler.untrack(chat_id).await;
        let state = self.registry.apply(chat_id, SessionEvent::Expired).await;
        self.keystore.purge(chat_id.get()).await?;
        self.history.clear(chat_id).await?;
        self.dismiss_invitation(chat_id).await;
        info!(
            chat_id = %chat_id,
            status = ?state.map(|s| s.status()),
            "Conversation expired, key and history purged"
        );
        Ok(())
    }

    /// Forget a conversation entirely.
    pub async fn remove_conversation(&self, chat_id: ChatId) -> Result<Option<SessionState>> {
        self.scheduler.untrack(chat_id).await;
        let removed = self.registry.remove(chat_id).await;
        self.keystore.purge(chat_id.get()).await?;
        self.history.clear(chat_id).await?;
        self.dismiss_invitation(chat_id).await;
        if self.active_conversation().await == Some(chat_id) {
            self.switch_to(None).await;
        }
        info!(chat_id = %chat_id, "Conversation removed");
        Ok(removed)
    }

    /// Purge every known conversation and disconnect.
    pub async fn logout(&self) -> Result<()> {
        for state in self.registry.all().await {
            let chat_id = state.chat_id();
            self.keystore.purge(chat_id.get()).await?;
            self.history.clear(chat_id).await?;
        }
        self.registry.clear().await;
        self.scheduler.clear().await;
        self.invitations.write().await.clear();
        self.switch_to(None).await;
        self.connection.disconnect().await?;
        info!(user_id = %self.me, "Logged out");
        Ok(())
    }
}

fn decrypt_body(chat_id: ChatId, message: &EncryptedMessage, keypair: Option<&ConversationKeyPair>) -> MessageBody {
    let Some(keypair) = keypair else {
        return MessageBody::Undecryptable;
    };
    match Ciphertext::from_base64(&message.ciphertext).and_then(|ct| MessageCodec::decrypt(&ct, keypair)) {
        Ok(text) => MessageBody::Text(text),
        Err(e) => {
            warn!(chat_id = %chat_id, message_id = message.id, error = %e, "CryptoFailure: message undecryptable");
            MessageBody::Undecryptable
        }
    }
}

#[async_trait]
impl ExpiryHandler for KeyExchangeCoordinator {
    async fn handle_expiry(&self, chat_id: ChatId) -> bool {
        match self.on_expire(chat_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Expiry deferred");
                false
            }
        }
    }
}
