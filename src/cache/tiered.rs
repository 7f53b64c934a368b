//! Two-tier response cache.
//!
//! Reads go local first, then durable; a durable hit backfills the local
//! tier with whatever TTL the durable entry has left. Writes go to both,
//! the durable write best-effort.
//!
//! # Failure semantics
//!
//! The durable tier is a network dependency the relay does not control.
//! Every durable error (transport, status, undecodable payload) is logged,
//! counted under [`CACHE_TIER_ERRORS_TOTAL`](crate::telemetry::CACHE_TIER_ERRORS_TOTAL),
//! and then treated as a miss or a no-op. Nothing in this module returns an
//! error to the caller.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::durable::{DurableStore, PutOptions};
use super::key::CacheKey;
use super::local::{CacheConfig, CacheEntry, CachedResponse, LocalCache, unix_now};
use crate::RelayError;
use crate::telemetry;
use crate::types::CacheTier;

/// Local tier plus an optional durable tier.
pub struct TieredCache {
    local: LocalCache,
    durable: Option<Arc<dyn DurableStore>>,
    config: CacheConfig,
}

impl TieredCache {
    /// Local-only cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            local: LocalCache::new(config.max_entries),
            durable: None,
            config,
        }
    }

    /// Attach a durable tier.
    pub fn with_durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    fn durable_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.config.key_prefix, key.as_str())
    }

    /// Look up `key`, reporting which tier answered.
    pub async fn get(&self, key: &CacheKey) -> Option<(CachedResponse, CacheTier)> {
        if let Some(value) = self.local.get(key.as_str()).await {
            record_hit(CacheTier::Local);
            return Some((value, CacheTier::Local));
        }

        if let Some(value) = self.get_durable(key).await {
            record_hit(CacheTier::Durable);
            return Some((value, CacheTier::Durable));
        }

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        None
    }

    async fn get_durable(&self, key: &CacheKey) -> Option<CachedResponse> {
        let store = self.durable.as_ref()?;
        let raw = match store.get(&self.durable_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tier_error(store.name(), "get", &e);
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tier_error(store.name(), "decode", &RelayError::from(e));
                return None;
            }
        };

        let remaining = entry.remaining(unix_now())?;
        debug!(key = %key, remaining_secs = remaining.as_secs(), "durable hit, backfilling local tier");
        self.local
            .insert(key.as_str(), entry.value.clone(), remaining)
            .await;
        Some(entry.value)
    }

    /// Store `value` in both tiers. `ttl` defaults to the configured TTL.
    pub async fn put(&self, key: &CacheKey, value: CachedResponse, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.ttl);
        self.local.insert(key.as_str(), value.clone(), ttl).await;

        let Some(store) = &self.durable else {
            return;
        };

        let entry = CacheEntry::new(value, ttl);
        let options = PutOptions {
            ttl_secs: Some(entry.ttl_secs.max(1)),
            metadata: Some(serde_json::json!({
                "model": entry.value.model,
                "createdAt": entry.created_at,
            })),
        };
        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                tier_error(store.name(), "encode", &RelayError::from(e));
                return;
            }
        };

        if let Err(e) = store.put(&self.durable_key(key), encoded, options).await {
            tier_error(store.name(), "put", &e);
        }
    }

    /// Empty the local tier and, if asked, every durable key under the
    /// configured prefix. Durable failures are logged and skipped.
    pub async fn clear(&self, include_durable: bool) {
        self.local.clear();
        if !include_durable {
            return;
        }
        let Some(store) = &self.durable else {
            return;
        };

        let keys = match store.list(&self.config.key_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tier_error(store.name(), "list", &e);
                return;
            }
        };

        let mut deleted = 0usize;
        for key in &keys {
            match store.delete(key).await {
                Ok(()) => deleted += 1,
                Err(e) => tier_error(store.name(), "delete", &e),
            }
        }
        debug!(deleted, listed = keys.len(), "cleared durable tier");
    }
}

fn record_hit(tier: CacheTier) {
    metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => tier.as_str()).increment(1);
}

fn tier_error(store: &str, op: &'static str, error: &RelayError) {
    metrics::counter!(telemetry::CACHE_TIER_ERRORS_TOTAL, "op" => op).increment(1);
    warn!(store, op, %error, "durable cache tier failed, degrading to local tier");
}
