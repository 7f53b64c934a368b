//! Builder for configuring pipeline instances

use std::sync::Arc;
use std::time::Duration;

use super::ChatPipeline;
use crate::cache::{CacheConfig, CacheKeyGenerator, DurableStore, SingleFlight, TieredCache};
use crate::providers::{
    CircuitBreakerConfig, DEFAULT_REQUEST_TIMEOUT, Dispatcher, InferenceProvider, RetryConfig,
    WorkersAiClient,
};
use crate::ratelimit::{FixedWindowLimiter, RateLimitConfig};
use crate::session::SessionStore;
use crate::validation::{OperationPolicy, ValidationLimits};
use crate::{RelayError, Result};

/// Model used when a request does not name one.
pub const DEFAULT_MODEL: &str = "@cf/meta/llama-3.1-8b-instruct";

/// Main entry point for creating pipeline instances.
pub struct ChatRelay;

impl ChatRelay {
    /// Create a new builder for configuring the pipeline.
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }
}

enum ProviderSource {
    Custom(Arc<dyn InferenceProvider>),
    WorkersAi { account_id: String, api_key: String },
    BaseUrl { base_url: String, api_key: String },
}

/// Builder for configuring pipeline instances.
pub struct RelayBuilder {
    provider: Option<ProviderSource>,
    default_model: String,
    fallback_model: Option<String>,
    retry: RetryConfig,
    request_timeout: Duration,
    circuit_breaker: Option<CircuitBreakerConfig>,
    cache: CacheConfig,
    durable: Option<Arc<dyn DurableStore>>,
    cache_salt: Option<Vec<u8>>,
    rate_limit: Option<RateLimitConfig>,
    single_flight: bool,
    sessions: Option<Arc<dyn SessionStore>>,
    limits: ValidationLimits,
    policy: OperationPolicy,
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            default_model: DEFAULT_MODEL.to_string(),
            fallback_model: None,
            retry: RetryConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            circuit_breaker: None,
            cache: CacheConfig::default(),
            durable: None,
            cache_salt: None,
            rate_limit: None,
            single_flight: false,
            sessions: None,
            limits: ValidationLimits::default(),
            policy: OperationPolicy::default(),
        }
    }

    /// Use Workers AI for the given account.
    pub fn workers_ai(mut self, account_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.provider = Some(ProviderSource::WorkersAi {
            account_id: account_id.into(),
            api_key: api_key.into(),
        });
        self
    }

    /// Use a Workers AI compatible API at an explicit base URL.
    pub fn workers_ai_base_url(
        mut self,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        self.provider = Some(ProviderSource::BaseUrl {
            base_url: base_url.into(),
            api_key: api_key.into(),
        });
        self
    }

    /// Use a custom provider implementation.
    pub fn provider(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.provider = Some(ProviderSource::Custom(provider));
        self
    }

    /// Model used when a request does not specify one.
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Model substituted when the requested one is not found.
    pub fn fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Bound on each provider call (default: 30s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable the circuit breaker.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Add a durable cache tier shared across instances.
    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Mix a deployment secret into cache keys.
    pub fn cache_salt(mut self, salt: impl AsRef<[u8]>) -> Self {
        self.cache_salt = Some(salt.as_ref().to_vec());
        self
    }

    /// Enable the per-minute rate limiter.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Collapse concurrent identical non-streaming misses into one dispatch.
    pub fn single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    /// Persist conversations that carry a thread id.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn validation_limits(mut self, limits: ValidationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn operation_policy(mut self, policy: OperationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoProvider`] if no provider is configured and
    /// [`RelayError::Configuration`] for an empty default model.
    pub fn build(self) -> Result<ChatPipeline> {
        let provider: Arc<dyn InferenceProvider> = match self.provider {
            Some(ProviderSource::Custom(provider)) => provider,
            Some(ProviderSource::WorkersAi {
                account_id,
                api_key,
            }) => Arc::new(WorkersAiClient::for_account(&account_id, api_key)?),
            Some(ProviderSource::BaseUrl { base_url, api_key }) => {
                Arc::new(WorkersAiClient::with_base_url(api_key, base_url)?)
            }
            None => return Err(RelayError::NoProvider),
        };

        if self.default_model.trim().is_empty() {
            return Err(RelayError::Configuration(
                "default model must not be empty".to_string(),
            ));
        }

        let mut dispatcher =
            Dispatcher::new(provider, self.retry).request_timeout(self.request_timeout);
        if let Some(fallback) = self.fallback_model.filter(|m| !m.is_empty()) {
            dispatcher = dispatcher.fallback_model(fallback);
        }
        if let Some(config) = self.circuit_breaker {
            dispatcher = dispatcher.circuit_breaker(config);
        }

        let mut cache = TieredCache::new(self.cache);
        if let Some(store) = self.durable {
            cache = cache.with_durable(store);
        }

        let keys = match self.cache_salt {
            Some(salt) => CacheKeyGenerator::with_salt(salt),
            None => CacheKeyGenerator::new(),
        };

        Ok(ChatPipeline {
            dispatcher,
            cache: Arc::new(cache),
            keys,
            limiter: self.rate_limit.map(FixedWindowLimiter::new),
            flight: self.single_flight.then(SingleFlight::new),
            sessions: self.sessions,
            limits: self.limits,
            policy: self.policy,
            default_model: self.default_model,
        })
    }
}
