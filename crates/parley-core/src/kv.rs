//! Namespaced key-value storage.
//!
//! The persistence collaborator behind private-key records and message
//! history. Writes are last-writer-wins per `(namespace, key)`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use sqlx::{Pool, Sqlite};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::db::{open_pool, open_pool_in_memory};

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Logical partitions of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Wrapped private-key records.
    Keys,
    /// Per-conversation encrypted message lists.
    Messages,
}

impl Namespace {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Keys => "keys",
            Self::Messages => "messages",
        }
    }
}

/// Persistent key-value collaborator.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Insert or overwrite `key` in `namespace`.
    async fn put(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError>;
}

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(Namespace, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in `namespace`.
    pub async fn len(&self, namespace: Namespace) -> usize {
        self.entries
            .read()
            .await
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .count()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert((namespace, key.to_string()), value);
        Ok(())
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(namespace, key.to_string()))
            .cloned())
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .remove(&(namespace, key.to_string()));
        Ok(())
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (namespace, key)
)";

/// `SQLite`-backed store, one row per `(namespace, key)`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            pool: open_pool(path).await?,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an in-memory store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            pool: open_pool_in_memory().await?,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        info!("Key-value store migrations complete");
        Ok(())
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn put(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO kv (namespace, key, value) VALUES (?, ?, ?)")
            .bind(namespace.as_str())
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        debug!(namespace = namespace.as_str(), key, "Stored entry");
        Ok(())
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT value FROM kv WHERE namespace = ? AND key = ?",
        )
        .bind(namespace.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE namespace = ? AND key = ?")
            .bind(namespace.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
