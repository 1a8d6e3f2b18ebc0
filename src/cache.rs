//! Time-bounded key/value cache backing the latest-table pointer and the
//! query cache.

use crate::error::SheetError;
use crate::store::Store;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const LATEST_TABLE_KEY: &str = "latest_table";
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Cache key of one page of query results.
pub fn page_key(table: &str, page: i64, search: &str) -> String {
    format!("data:{table}:{page}:search:{search}")
}

/// A shared cache with per-entry expiry. Reads never extend an entry's life.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SheetError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SheetError>;
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, SheetError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SheetError> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    value: String,
    expires_at_ms: i64,
}

/// Cache kept in the store's `cache` tree; entries outlive a restart until
/// they expire. Expiry uses wall-clock milliseconds.
#[derive(Clone)]
pub struct SledCache {
    store: Store,
}

impl SledCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn read(store: &Store, key: &str) -> Result<Option<String>, SheetError> {
        let tree = store.cache_tree();
        let Some(raw) = tree.get(key)? else {
            return Ok(None);
        };
        let record: CacheRecord = bincode::deserialize(&raw)?;
        if record.expires_at_ms <= Self::now_ms() {
            // Only remove the entry we looked at, not a fresher one written since.
            let _ = tree.compare_and_swap(key, Some(raw), None as Option<&[u8]>)?;
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    fn write(store: &Store, key: &str, value: String, ttl: Duration) -> Result<(), SheetError> {
        let ttl_ms = i64::try_from(ttl.as_millis())
            .map_err(|_| SheetError::Cache(format!("ttl too large for key {key}")))?;
        let record = CacheRecord {
            value,
            expires_at_ms: Self::now_ms().saturating_add(ttl_ms),
        };
        store
            .cache_tree()
            .insert(key, bincode::serialize(&record)?)?;
        Ok(())
    }
}

// sled may hit the disk; keep it off the async workers.
#[async_trait]
impl CacheStore for SledCache {
    async fn get(&self, key: &str) -> Result<Option<String>, SheetError> {
        let store = self.store.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::read(&store, &key)).await?
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SheetError> {
        let store = self.store.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || Self::write(&store, &key, value, ttl)).await?
    }
}

/// The `latest_table` slot naming the most recently ingested table.
#[derive(Clone)]
pub struct LatestTable {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl LatestTable {
    pub fn new(cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Last writer wins.
    pub async fn publish(&self, table: &str) -> Result<(), SheetError> {
        self.cache.set_ex(LATEST_TABLE_KEY, table, self.ttl).await?;
        debug!(table, ttl_secs = self.ttl.as_secs(), "published latest table");
        Ok(())
    }

    pub async fn current(&self) -> Result<Option<String>, SheetError> {
        self.cache.get(LATEST_TABLE_KEY).await
    }
}
