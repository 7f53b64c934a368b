//! Configuration loading for relayd.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.chatrelay/config.toml` (user)
//! 3. `/etc/chatrelay/config.toml` (system)
//!
//! Secrets are loaded separately with mandatory permission checks:
//! 1. `~/.chatrelay/secrets.toml` (user, must be 0600)
//! 2. `/etc/chatrelay/secrets.toml` (system, must be 0600)
//!
//! and fall back to `CHATRELAY_API_KEY`, `CHATRELAY_KV_TOKEN` and
//! `CHATRELAY_CACHE_SALT`.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::providers::{CircuitBreakerConfig, RetryConfig};
use crate::ratelimit::RateLimitConfig;
use crate::validation::{OperationPolicy, ValidationLimits};
use crate::{RelayError, Result};

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Present = breaker enabled.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub cache: CacheSection,
    /// Present = limiter enabled.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// Server network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:8787).
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:8787".to_string()
}

/// Upstream inference API.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Workers AI account. Ignored when `base_url` is set.
    #[serde(default)]
    pub account_id: Option<String>,
    /// Explicit API base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Alternative base URLs; the fastest reachable one wins at startup.
    #[serde(default)]
    pub candidate_urls: Vec<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    /// Per-call timeout in seconds (default: 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            base_url: None,
            candidate_urls: Vec::new(),
            probe_timeout_ms: default_probe_timeout_ms(),
            default_model: None,
            fallback_model: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    1500
}

fn default_request_timeout() -> u64 {
    30
}

impl ProviderConfig {
    /// The base URL to use before probing, if one can be derived.
    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url.clone().or_else(|| {
            self.account_id
                .as_ref()
                .map(|id| format!("https://api.cloudflare.com/client/v4/accounts/{id}/ai"))
        })
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub single_flight: bool,
    /// Present = durable KV tier enabled.
    #[serde(default)]
    pub durable: Option<DurableConfig>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
            single_flight: false,
            durable: None,
        }
    }
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_key_prefix() -> String {
    "chatrelay:".to_string()
}

impl CacheSection {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .max_entries(self.max_entries)
            .ttl(Duration::from_secs(self.ttl_secs))
            .key_prefix(self.key_prefix.clone())
    }
}

/// KV namespace backing the durable tier.
#[derive(Debug, Clone, Deserialize)]
pub struct DurableConfig {
    pub account_id: String,
    pub namespace_id: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Inbound limits plus the operation policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationSection {
    #[serde(flatten)]
    pub limits: ValidationLimits,
    #[serde(default)]
    pub operation_policy: OperationPolicy,
}

/// Conversation persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_session_messages")]
    pub max_messages: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_messages: default_session_messages(),
        }
    }
}

fn default_session_messages() -> usize {
    200
}

/// Secrets configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub provider: Option<ApiKeySecret>,
    #[serde(default)]
    pub kv: Option<KvSecret>,
    #[serde(default)]
    pub cache_salt: Option<String>,
}

/// A single API key secret.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeySecret {
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvSecret {
    pub api_token: String,
}

const API_KEY_ENV: &str = "CHATRELAY_API_KEY";
const KV_TOKEN_ENV: &str = "CHATRELAY_KV_TOKEN";
const CACHE_SALT_ENV: &str = "CHATRELAY_CACHE_SALT";

impl Config {
    /// Load configuration from the standard locations.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            RelayError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::parse(&content)
            .map_err(|e| RelayError::Configuration(format!("Failed to parse config file {path:?}: {e}")))
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(RelayError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".chatrelay").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/chatrelay/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(RelayError::Configuration(
            "No config file found. Create ~/.chatrelay/config.toml or /etc/chatrelay/config.toml"
                .to_string(),
        ))
    }
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Returns empty secrets if no file exists (env vars may still apply).
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".chatrelay").join("secrets.toml");
            if user_secrets.exists() {
                return Self::load_from_path(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/chatrelay/secrets.toml");
        if system_secrets.exists() {
            return Self::load_from_path(&system_secrets);
        }

        Ok(Secrets::default())
    }

    /// Load one secrets file, rejecting group/world-readable files.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            RelayError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            RelayError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            RelayError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(RelayError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// Provider API key, falling back to `CHATRELAY_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        self.provider
            .as_ref()
            .map(|s| s.api_key.clone())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
    }

    /// KV token, falling back to `CHATRELAY_KV_TOKEN`.
    pub fn kv_token(&self) -> Option<String> {
        self.kv
            .as_ref()
            .map(|s| s.api_token.clone())
            .or_else(|| std::env::var(KV_TOKEN_ENV).ok())
    }

    /// Cache key salt, falling back to `CHATRELAY_CACHE_SALT`.
    pub fn cache_salt(&self) -> Option<String> {
        self.cache_salt
            .clone()
            .or_else(|| std::env::var(CACHE_SALT_ENV).ok())
            .filter(|s| !s.is_empty())
    }
}
