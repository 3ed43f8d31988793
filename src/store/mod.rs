//! Metadata Store
//!
//! Key/value persistence for upload bookkeeping with:
//! - Per-store TTL stamped on newly created records
//! - Prefix namespacing so server and client caches can share a backend
//! - Merge-on-write: `set` shallow-merges into whatever is already stored
//!
//! Backends:
//! - `MemoryStore`: in-process map, mostly for tests
//! - `FileStore`: single JSON document guarded by filesystem locks
//! - `SqliteStore`: SQL-backed key/value service

pub mod file;
pub mod memory;
pub mod sqlite;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::*;

/// Prefix used by server-side stores
pub const SERVER_PREFIX: &str = "tus:server:";

/// Prefix used by client-side caches
pub const CLIENT_PREFIX: &str = "tus:client:";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

// ============================================================================
// Settings
// ============================================================================

/// Namespace and lifetime shared by every backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub prefix: String,
    pub ttl_secs: u64,
}

impl StoreSettings {
    pub fn new(prefix: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            prefix: prefix.into(),
            ttl_secs,
        }
    }

    /// Full storage key for an upload key
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Upload key for a storage key, if it belongs to this namespace
    pub fn strip<'a>(&self, stored: &'a str) -> Option<&'a str> {
        stored.strip_prefix(self.prefix.as_str())
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::new(SERVER_PREFIX, DEFAULT_TTL_SECS)
    }
}

// ============================================================================
// Store contract
// ============================================================================

#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn settings(&self) -> &StoreSettings;

    /// Re-home this store under another namespace
    fn set_prefix(&mut self, prefix: &str);

    /// Fetch a record; expired records are hidden unless `include_expired`
    async fn get(&self, key: &str, include_expired: bool) -> Result<Option<RecordFields>, StoreError>;

    /// Merge `fields` into the record, creating (and TTL-stamping) it if absent
    async fn set(&self, key: &str, fields: RecordFields) -> Result<(), StoreError>;

    /// Returns whether anything was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns whether at least one key was removed
    async fn delete_all(&self, keys: &[String]) -> Result<bool, StoreError> {
        let mut removed = false;
        for key in keys {
            removed |= self.delete(key).await?;
        }
        Ok(removed)
    }

    /// Every key in this namespace, expired or not, without the prefix
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    fn ttl_secs(&self) -> u64 {
        self.settings().ttl_secs
    }
}

/// Shared handle to whichever backend the configuration selected
pub type SharedStore = Arc<dyn MetadataStore>;

/// Typed read of a server-side upload record
pub async fn get_upload(
    store: &dyn MetadataStore,
    key: &str,
    include_expired: bool,
) -> Result<Option<UploadRecord>, StoreError> {
    match store.get(key, include_expired).await? {
        Some(fields) => UploadRecord::from_fields(fields).map(Some),
        None => Ok(None),
    }
}

/// Open the backend named in the configuration under `prefix`
pub async fn open(config: &StoreConfig, prefix: &str) -> Result<SharedStore, StoreError> {
    let settings = StoreSettings::new(prefix, config.ttl_secs);

    let store: SharedStore = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(settings)),
        StoreBackend::File => Arc::new(FileStore::new(config.path.clone(), settings)),
        StoreBackend::Sqlite => Arc::new(SqliteStore::connect(&config.database_url, settings).await?),
    };

    tracing::info!(
        backend = ?config.backend,
        prefix = %prefix,
        ttl_secs = config.ttl_secs,
        "Opened metadata store"
    );

    Ok(store)
}
