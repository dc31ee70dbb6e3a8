//! Result Cache
//!
//! Key/value store with optional per-entry TTL. Query memos are written with
//! a short TTL, scheduler snapshots without one. Two backends:
//! `MokaResultCache` (in-process) and `RedisResultCache` (shared).
//!
//! Callers go through `CacheLayer`, which turns every backend failure into a
//! logged cache miss.

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on in-process entries
const DEFAULT_MAX_CAPACITY: u64 = 10_000;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`; `ttl = None` keeps it until overwritten
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CachedEntry {
    payload: Arc<str>,
    ttl: Option<Duration>,
}

/// Expire each entry after its own TTL, restarting on overwrite
struct PerEntryTtl;

impl Expiry<String, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process cache backed by moka
#[derive(Clone)]
pub struct MokaResultCache {
    entries: Cache<String, CachedEntry>,
}

impl MokaResultCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_CAPACITY)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();

        Self { entries }
    }
}

impl Default for MokaResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for MokaResultCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .entries
            .get(key)
            .await
            .map(|entry| entry.payload.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let entry = CachedEntry {
            payload: Arc::from(value),
            ttl,
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }
}

/// Shared cache backed by a redis server
#[derive(Clone)]
pub struct RedisResultCache {
    conn: MultiplexedConnection,
}

impl RedisResultCache {
    pub async fn connect(host: &str, port: u16) -> Result<Self, CacheError> {
        let client = redis::Client::open(format!("redis://{}:{}/", host, port))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            // SETEX rejects a zero expiry
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }
}

/// Typed, failure-swallowing front of a `ResultCache`.
///
/// Reads that fail, time out or hold undecodable JSON are misses; writes
/// that fail are logged and dropped.
#[derive(Clone)]
pub struct CacheLayer {
    backend: Arc<dyn ResultCache>,
    timeout: Duration,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn ResultCache>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match tokio::time::timeout(self.timeout, self.backend.get(key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                warn!(key = key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
            Err(_) => {
                warn!(key = key, timeout_ms = self.timeout.as_millis() as u64, "Cache read timed out");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key = key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = key, error = %e, "Cached value is unreadable, treating as miss");
                None
            }
        }
    }

    /// Write and wait for the backend, for writes that later reads depend on
    pub async fn store_best_effort<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let Some(payload) = serialize_entry(key, value) else {
            return;
        };
        write_entry(self.backend.as_ref(), self.timeout, key, payload, ttl).await;
    }

    /// Fire-and-forget write; the caller never waits on the backend
    pub fn store_detached<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let Some(payload) = serialize_entry(key, value) else {
            return;
        };
        let backend = self.backend.clone();
        let timeout = self.timeout;
        let key = key.to_string();

        tokio::spawn(async move {
            write_entry(backend.as_ref(), timeout, &key, payload, ttl).await;
        });
    }
}

fn serialize_entry<T: Serialize>(key: &str, value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(key = key, error = %e, "Failed to serialize cache value");
            None
        }
    }
}

async fn write_entry(
    backend: &dyn ResultCache,
    timeout: Duration,
    key: &str,
    payload: String,
    ttl: Option<Duration>,
) {
    match tokio::time::timeout(timeout, backend.set(key, payload, ttl)).await {
        Ok(Ok(())) => debug!(key = key, ttl_secs = ttl.map(|t| t.as_secs()), "Cache write"),
        Ok(Err(e)) => warn!(key = key, error = %e, "Cache write failed"),
        Err(_) => warn!(key = key, "Cache write timed out"),
    }
}
