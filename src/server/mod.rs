//! HTTP daemon support.
//!
//! This module provides:
//! - Configuration and secrets loading (`config`)
//! - The axum router (`http`)
//! - [`build_pipeline`], wiring a loaded config into a [`ChatPipeline`]

pub mod config;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::{KvRestConfig, KvRestStore};
use crate::gateway::{ChatPipeline, ChatRelay};
use crate::providers::EndpointProbe;
use crate::session::MemorySessionStore;
use crate::{RelayError, Result};

pub use config::{Config, Secrets};
pub use http::router;

/// Build a pipeline from daemon configuration.
///
/// Probes `provider.candidate_urls` first, so this performs network I/O
/// when candidates are configured.
pub async fn build_pipeline(config: &Config, secrets: &Secrets) -> Result<ChatPipeline> {
    let api_key = secrets.api_key().ok_or_else(|| {
        RelayError::Configuration(
            "no API key: set [provider] api_key in secrets.toml or CHATRELAY_API_KEY".to_string(),
        )
    })?;
    let default_url = config.provider.resolved_base_url().ok_or_else(|| {
        RelayError::Configuration(
            "set provider.account_id or provider.base_url".to_string(),
        )
    })?;

    let base_url = EndpointProbe::new(default_url)
        .candidates(config.provider.candidate_urls.iter().cloned())
        .probe_timeout(Duration::from_millis(config.provider.probe_timeout_ms))
        .select()
        .await;
    info!(base_url = %base_url, "using inference endpoint");

    let mut builder = ChatRelay::builder()
        .workers_ai_base_url(base_url, api_key)
        .retry(config.retry.clone())
        .request_timeout(Duration::from_secs(config.provider.request_timeout_secs))
        .cache(config.cache.cache_config())
        .single_flight(config.cache.single_flight)
        .validation_limits(config.validation.limits)
        .operation_policy(config.validation.operation_policy);

    if let Some(model) = &config.provider.default_model {
        builder = builder.default_model(model.clone());
    }
    if let Some(model) = &config.provider.fallback_model {
        builder = builder.fallback_model(model.clone());
    }
    if let Some(breaker) = &config.circuit_breaker {
        builder = builder.circuit_breaker(breaker.clone());
    }
    if let Some(limit) = config.rate_limit {
        builder = builder.rate_limit(limit);
    }
    if let Some(salt) = secrets.cache_salt() {
        builder = builder.cache_salt(salt);
    }

    if let Some(durable) = &config.cache.durable {
        let token = secrets.kv_token().ok_or_else(|| {
            RelayError::Configuration(
                "durable cache enabled but no KV token: set [kv] api_token in secrets.toml or CHATRELAY_KV_TOKEN"
                    .to_string(),
            )
        })?;
        let mut kv = KvRestConfig::new(&durable.account_id, &durable.namespace_id, token);
        if let Some(url) = &durable.base_url {
            kv = kv.base_url(url.clone());
        }
        builder = builder.durable_store(Arc::new(KvRestStore::new(kv)?));
    }

    if config.sessions.enabled {
        builder = builder.session_store(Arc::new(MemorySessionStore::new(
            config.sessions.max_messages,
        )));
    }

    builder.build()
}
