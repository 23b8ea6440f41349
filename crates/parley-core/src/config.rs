//! Configuration resolution for Parley.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/parley/settings.json)
//! 3. Project config (.parley/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default conversation key lifetime: two minutes.
pub const DEFAULT_KEY_TTL_SECS: u64 = 120;

/// PBKDF2-SHA256 iteration count for wrapping private keys at rest.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 200_000;

/// Complete Parley configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Conversation key material settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Lifetime of a freshly generated conversation key pair (seconds).
    pub ttl_secs: u64,
    /// PBKDF2 rounds used when wrapping the private half.
    pub pbkdf2_iterations: u32,
    /// How many times `RegisterPublicKey` is attempted before giving up.
    pub register_attempts: u32,
}

impl KeyConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_KEY_TTL_SECS,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            register_attempts: 3,
        }
    }
}

/// Expiration scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
}

impl SchedulerConfig {
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

/// Persistent store settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// `SQLite` file backing the key-value store. In-memory when unset.
    pub database_path: Option<PathBuf>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".parley").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".parley").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/parley/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("parley").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Parse a single config file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.keys = overlay.keys;
    base.scheduler = overlay.scheduler;
    if overlay.storage.database_path.is_some() {
        base.storage.database_path = overlay.storage.database_path;
    }
    base.logging = overlay.logging;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("PARLEY_KEY_TTL_SECS") {
        if let Ok(n) = val.parse() {
            config.keys.ttl_secs = n;
        }
    }
    if let Ok(val) = std::env::var("PARLEY_PBKDF2_ITERATIONS") {
        if let Ok(n) = val.parse() {
            config.keys.pbkdf2_iterations = n;
        }
    }
    if let Ok(val) = std::env::var("PARLEY_TICK_INTERVAL_MS") {
        if let Ok(n) = val.parse() {
            config.scheduler.tick_interval_ms = n;
        }
    }
    if let Ok(val) = std::env::var("PARLEY_DATABASE_PATH") {
        config.storage.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("PARLEY_LOG_LEVEL") {
        config.logging.level = val;
    }
}
