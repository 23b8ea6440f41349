//! Two clients, one hub.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use parley_core::clock::{Clock, SystemClock};
use parley_core::config::Config;
use parley_core::kv::{KeyValueStore, MemoryStore};
use parley_session::{
    ChatId, ChatStatus, ConnectionManager, CoordinatorConfig, KeyExchangeCoordinator, LoopbackHub, MessageBody,
    UserId,
};
use tracing::{info, warn};

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);
const FIRST_CHAT_ID: u64 = 1;
const STEP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub struct DemoOptions {
    pub message: String,
    pub reply: String,
    pub password: String,
    pub wait_for_expiry: bool,
}

/// Poll `check` until it holds or [`STEP_TIMEOUT`] passes.
async fn wait_until<F, Fut>(what: &str, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !check().await {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(STEP_TIMEOUT, poll)
        .await
        .with_context(|| format!("timed out waiting for {what}"))
}

async fn status_of(coordinator: &KeyExchangeCoordinator, chat_id: ChatId) -> Option<ChatStatus> {
    coordinator.registry().get(chat_id).await.map(|s| s.status())
}

#[allow(clippy::print_stdout)]
async fn print_transcript(name: &str, coordinator: &KeyExchangeCoordinator, chat_id: ChatId) -> anyhow::Result<()> {
    let Some(messages) = coordinator.render(chat_id).await? else {
        warn!(chat_id = %chat_id, "Render superseded");
        return Ok(());
    };
    println!("--- {name}'s view of chat {chat_id} ---");
    for message in messages {
        match message.body {
            MessageBody::Text(text) => println!("[{:?}] {text}", message.direction),
            MessageBody::Undecryptable => println!("[{:?}] <unable to decrypt>", message.direction),
        }
    }
    Ok(())
}

pub async fn run(config: &Config, alice_store: Arc<dyn KeyValueStore>, options: DemoOptions) -> anyhow::Result<()> {
    let hub = LoopbackHub::new(FIRST_CHAT_ID);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let coordinator_config = CoordinatorConfig::from_config(config);

    let alice = Arc::new(KeyExchangeCoordinator::new(
        ALICE,
        Arc::new(ConnectionManager::new(Arc::new(hub.channel()))),
        alice_store,
        Arc::clone(&clock),
        &options.password,
        coordinator_config.clone(),
    ));
    let bob = Arc::new(KeyExchangeCoordinator::new(
        BOB,
        Arc::new(ConnectionManager::new(Arc::new(hub.channel()))),
        Arc::new(MemoryStore::new()),
        clock,
        &options.password,
        coordinator_config,
    ));

    let alice_pump = alice.connect().await?;
    let bob_pump = bob.connect().await?;
    let tick = config.scheduler.tick_interval();
    let alice_timer = alice.spawn_scheduler(tick);
    let bob_timer = bob.spawn_scheduler(tick);

    // Alice invites; the hub assigns the chat id.
    let invited = alice.send_invite(BOB, None).await?;
    let chat_id = invited.chat_id();
    info!(chat_id = %chat_id, status = invited.status().as_str(), "Alice sent invite");

    wait_until("Bob to see the invitation", || {
        let bob = Arc::clone(&bob);
        async move { bob.pending_invitations().await.iter().any(|i| i.chat_id == chat_id) }
    })
    .await?;

    let accepted = bob.send_invite(ALICE, Some(chat_id)).await?;
    info!(chat_id = %chat_id, status = accepted.status().as_str(), "Bob accepted");

    wait_until("Alice to become active", || {
        let alice = Arc::clone(&alice);
        async move { status_of(&alice, chat_id).await == Some(ChatStatus::Active) }
    })
    .await?;

    if let Some(state) = alice.registry().get(chat_id).await {
        if let (Some(mine), Some(theirs)) = (&state.my_public_key, &state.counterpart_public_key) {
            info!(
                chat_id = %chat_id,
                alice_key = %mine.fingerprint(),
                bob_key = %theirs.fingerprint(),
                "Handshake complete"
            );
        }
    }

    alice.send_message(chat_id, &options.message).await?;
    wait_until("Bob to receive the message", || {
        let bob = Arc::clone(&bob);
        async move { bob.history().load(chat_id).await.is_ok_and(|m| !m.is_empty()) }
    })
    .await?;

    bob.send_message(chat_id, &options.reply).await?;
    wait_until("Alice to receive the reply", || {
        let alice = Arc::clone(&alice);
        async move { alice.history().load(chat_id).await.is_ok_and(|m| m.len() >= 2) }
    })
    .await?;

    print_transcript("alice", &alice, chat_id).await?;
    print_transcript("bob", &bob, chat_id).await?;

    if options.wait_for_expiry {
        let ttl = config.keys.ttl();
        info!(chat_id = %chat_id, ttl_secs = ttl.as_secs(), "Waiting for keys to expire");
        let deadline = ttl + STEP_TIMEOUT;
        let expired = tokio::time::timeout(deadline, async {
            while status_of(&alice, chat_id).await != Some(ChatStatus::Expired) {
                tokio::time::sleep(tick).await;
            }
        })
        .await;
        if expired.is_err() {
            bail!("chat {chat_id} did not expire within {}s", deadline.as_secs());
        }
        info!(chat_id = %chat_id, "Conversation expired, keys and history purged");
    }

    alice_timer.stop().await;
    bob_timer.stop().await;
    alice.logout().await?;
    bob.logout().await?;
    let _ = tokio::join!(alice_pump, bob_pump);
    Ok(())
}
