//! Parley Core Library
//!
//! Shared functionality for Parley components:
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Wall-clock abstraction for expiry decisions
//! - Namespaced key-value storage (in-memory and `SQLite`)
//! - Common error types

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod kv;
pub mod tracing_init;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use kv::{KeyValueStore, MemoryStore, Namespace, SqliteStore, StoreError};
