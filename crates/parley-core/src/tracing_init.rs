//! Shared tracing/logging initialization.
//!
//! The `parley` binary and any embedding host set up `tracing_subscriber`
//! the same way: an env-filter plus either human-readable or JSON lines.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- filter used when `RUST_LOG` is not set
///   (e.g. `"parley_session=info"`).
/// * `log_json` -- emit structured JSON lines instead of the pretty format.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .is_ok()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .is_ok()
    }
}

/// Build the default filter for the Parley crates at the configured level.
pub fn default_filter(logging: &LoggingConfig) -> String {
    let level = &logging.level;
    format!("parley={level},parley_core={level},parley_crypto={level},parley_session={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_all_crates() {
        let filter = default_filter(&LoggingConfig {
            level: "debug".to_string(),
            json: false,
        });
        assert!(filter.contains("parley_session=debug"));
        assert!(filter.contains("parley_crypto=debug"));
        assert!(filter.starts_with("parley=debug"));
    }
}
