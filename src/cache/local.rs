//! In-process cache tier.
//!
//! [`LocalCache`] wraps moka's async cache with a per-entry expiry policy:
//! each entry carries its own TTL, measured from the moment it was inserted.
//! Capacity is bounded (moka evicts by its TinyLFU policy once
//! `max_entries` is reached), so a long-running daemon cannot grow without
//! bound.
//!
//! A hit costs a hash lookup and an `Arc` clone, and never suspends on I/O.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use moka::Expiry;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

/// Configuration for the two-tier response cache.
///
/// ```rust
/// # use chatrelay::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(3600))
///     .key_prefix("chat:");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of local entries. Default: 10,000.
    pub max_entries: u64,
    /// Time-to-live for new entries. Default: 1 hour.
    pub ttl: Duration,
    /// Prefix for durable-tier keys; also scopes `clear(true)`. Default: `"chatrelay:"`.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
            key_prefix: "chatrelay:".to_string(),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of local entries.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the time-to-live for new entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the durable-tier key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// The cached payload: generated text and the model that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Durable-tier record, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub value: CachedResponse,
    /// Unix seconds.
    pub created_at: u64,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(value: CachedResponse, ttl: Duration) -> Self {
        Self {
            value,
            created_at: unix_now(),
            ttl_secs: ttl.as_secs(),
        }
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining(&self, now: u64) -> Option<Duration> {
        let expires_at = self.created_at.saturating_add(self.ttl_secs);
        (expires_at > now).then(|| Duration::from_secs(expires_at - now))
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug)]
struct LocalEntry {
    value: CachedResponse,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Arc<LocalEntry>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<LocalEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<LocalEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-memory tier with per-entry TTL.
pub struct LocalCache {
    cache: Cache<String, Arc<LocalEntry>>,
}

impl LocalCache {
    /// Create an empty tier holding at most `max_entries`.
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    /// Look up a live entry.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        self.cache.get(key).await.map(|e| e.value.clone())
    }

    /// Insert (or overwrite) an entry that expires `ttl` from now.
    ///
    /// A zero TTL is a no-op.
    pub async fn insert(&self, key: &str, value: CachedResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.cache
            .insert(key.to_string(), Arc::new(LocalEntry { value, ttl }))
            .await;
    }

    /// Evict all entries.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Approximate number of entries (moka updates this lazily).
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flush moka's pending maintenance so counts are exact.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}
