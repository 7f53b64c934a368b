//! Durable cache tier backends.
//!
//! The durable tier is an external key-value system shared by every relay
//! instance. The relay only needs four operations, captured by
//! [`DurableStore`]. Every call may fail independently; callers (the tiered
//! cache) swallow those failures, so implementations should report them
//! honestly rather than retrying internally.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: process-local, honours TTLs. Useful for tests and
//!   single-instance deployments that still want the tier semantics.
//! - [`KvRestStore`]: a Cloudflare-KV-style REST API over reqwest.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use crate::{RelayError, Result};

/// Options for [`DurableStore::put`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    /// Seconds until the backend should drop the value.
    pub ttl_secs: Option<u64>,
    /// Small JSON blob stored alongside the value.
    pub metadata: Option<serde_json::Value>,
}

/// Narrow interface to an external key-value store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Fetch a value; `Ok(None)` when absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, overwriting any previous one (last write wins).
    async fn put(&self, key: &str, value: String, options: PutOptions) -> Result<()>;

    /// List keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
    metadata: Option<serde_json::Value>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process [`DurableStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata stored with `key`, if any.
    pub fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).and_then(|v| v.metadata.clone())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|v| v.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(stored) if stored.is_live(now) => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String, options: PutOptions) -> Result<()> {
        let expires_at = options
            .ttl_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at,
                metadata: options.metadata,
            },
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// KvRestStore
// ============================================================================

/// Default base URL for the Cloudflare v4 API.
const DEFAULT_KV_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// The backend rejects TTLs below one minute.
const MIN_KV_TTL_SECS: u64 = 60;

/// Connection settings for [`KvRestStore`].
#[derive(Debug, Clone)]
pub struct KvRestConfig {
    pub base_url: String,
    pub account_id: String,
    pub namespace_id: String,
    pub api_token: String,
    /// Per-call timeout. Default: 5s.
    pub timeout: Duration,
}

impl KvRestConfig {
    pub fn new(
        account_id: impl Into<String>,
        namespace_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: DEFAULT_KV_BASE_URL.to_string(),
            account_id: account_id.into(),
            namespace_id: namespace_id.into(),
            api_token: api_token.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Override the API base URL (for testing with wiremock).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// [`DurableStore`] backed by a KV namespace REST API.
#[derive(Clone)]
pub struct KvRestStore {
    http: Client,
    namespace_url: Url,
    api_token: String,
}

#[derive(Deserialize)]
struct KvListResponse {
    #[serde(default)]
    result: Vec<KvKey>,
    #[serde(default)]
    result_info: Option<KvResultInfo>,
}

#[derive(Deserialize)]
struct KvKey {
    name: String,
}

#[derive(Deserialize)]
struct KvResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

impl KvRestStore {
    pub fn new(config: KvRestConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(crate::version::user_agent())
            .build()
            .map_err(|e| RelayError::Configuration(format!("failed to build HTTP client: {e}")))?;

        let mut namespace_url = Url::parse(&config.base_url)
            .map_err(|e| RelayError::Configuration(format!("invalid KV base URL: {e}")))?;
        namespace_url
            .path_segments_mut()
            .map_err(|_| RelayError::Configuration("KV base URL must be hierarchical".to_string()))?
            .pop_if_empty()
            .extend([
                "accounts",
                config.account_id.as_str(),
                "storage",
                "kv",
                "namespaces",
                config.namespace_id.as_str(),
            ]);

        Ok(Self {
            http,
            namespace_url,
            api_token: config.api_token,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.namespace_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    fn check_status(response: &reqwest::Response, op: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RelayError::Cache(format!("KV {op} failed with status {status}")))
        }
    }
}

#[async_trait]
impl DurableStore for KvRestStore {
    fn name(&self) -> &str {
        "kv-rest"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self
            .http
            .get(self.url(&["values", key]))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| RelayError::Cache(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(&response, "get")?;

        response
            .text()
            .await
            .map(Some)
            .map_err(|e| RelayError::Cache(e.to_string()))
    }

    async fn put(&self, key: &str, value: String, options: PutOptions) -> Result<()> {
        let mut url = self.url(&["values", key]);
        if let Some(ttl) = options.ttl_secs {
            url.query_pairs_mut()
                .append_pair("expiration_ttl", &ttl.max(MIN_KV_TTL_SECS).to_string());
        }

        let mut form = reqwest::multipart::Form::new().text("value", value);
        if let Some(metadata) = &options.metadata {
            form = form.text("metadata", serde_json::to_string(metadata)?);
        }

        let response = self
            .http
            .put(url)
            .bearer_auth(&self.api_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RelayError::Cache(e.to_string()))?;
        Self::check_status(&response, "put")
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = self.url(&["keys"]);
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                if let Some(c) = &cursor {
                    query.append_pair("cursor", c);
                }
            }

            let response = self
                .http
                .get(url)
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(|e| RelayError::Cache(e.to_string()))?;
            Self::check_status(&response, "list")?;

            let page: KvListResponse = response
                .json()
                .await
                .map_err(|e| RelayError::Cache(e.to_string()))?;
            keys.extend(page.result.into_iter().map(|k| k.name));

            cursor = page
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                return Ok(keys);
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&["values", key]))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| RelayError::Cache(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(&response, "delete")
    }
}
