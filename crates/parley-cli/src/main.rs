//! Parley CLI
//!
//! Runs two chat clients against an in-process hub: an invite, an accept,
//! one encrypted message each way, and optionally the expiry of the keys.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parley_core::config::{self, Config};
use parley_core::kv::{KeyValueStore, MemoryStore, SqliteStore};
use parley_core::tracing_init::{default_filter, init_tracing};
use tracing::info;

use crate::demo::DemoOptions;

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about = "End-to-end encrypted chat key exchange demo", long_about = None)]
struct Cli {
    /// Message Alice sends once the handshake completes
    #[arg(short, long, default_value = "hello, bob")]
    message: String,

    /// Reply Bob sends back
    #[arg(short, long, default_value = "hi alice")]
    reply: String,

    /// Password wrapping the private keys at rest
    #[arg(long, env = "PARLEY_PASSWORD", default_value = "parley-demo")]
    password: String,

    /// Key lifetime in seconds (overrides config)
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// `SQLite` file for Alice's key and message store (overrides config)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Persist Alice's store under the local data directory
    #[arg(long)]
    persist: bool,

    /// Keep running until the conversation keys expire
    #[arg(long)]
    wait_for_expiry: bool,

    /// Project directory holding `.parley/settings.json`
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(ttl) = self.ttl_secs {
            config.keys.ttl_secs = ttl;
        }
        if let Some(path) = &self.database {
            config.storage.database_path = Some(path.clone());
        } else if self.persist && config.storage.database_path.is_none() {
            config.storage.database_path = dirs::data_local_dir().map(|d| d.join("parley").join("parley.db"));
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    match &config.storage.database_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!(path = %path.display(), "Opening SQLite store");
            Ok(Arc::new(SqliteStore::open(path).await?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.project_dir.as_deref())?;
    cli.apply_overrides(&mut config);
    init_tracing(&default_filter(&config.logging), config.logging.json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting parley");

    let store = open_store(&config).await?;
    let options = DemoOptions {
        message: cli.message,
        reply: cli.reply,
        password: cli.password,
        wait_for_expiry: cli.wait_for_expiry,
    };
    demo::run(&config, store, options).await
}
