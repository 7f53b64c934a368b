//! Retry, timeout, fallback, and circuit breaking around one provider.
//!
//! # Dispatch flow
//!
//! ```text
//! dispatch(model)
//!     │
//!     ├── breaker open? ──► CircuitOpen (no network call)
//!     │
//!     ▼
//!  with_retry ─┬─ call(model) bounded by request_timeout
//!              └─ transient? sleep backoff, call again (max_attempts)
//!     │
//!     ├── ModelNotFound / 404, fallback configured and != model
//!     │       └──► with_retry ─ call(fallback)   (own budget, terminal)
//!     ▼
//!  breaker.record(outcome)
//! ```
//!
//! One breaker failure is recorded per dispatch that ends in a transient
//! error, not per attempt. A permanent error means the provider answered,
//! so it counts as a success for the breaker.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use super::retry::{RetryConfig, with_retry};
use super::traits::{ByteStream, InferenceProvider};
use crate::telemetry;
use crate::types::{GenerationParams, Message};
use crate::{RelayError, Result};

/// Default bound on each individual provider call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A provider result plus the model that produced it.
pub struct Dispatched<T> {
    pub value: T,
    pub model: String,
    pub used_fallback: bool,
}

/// Dispatcher counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub requests: u64,
    pub errors: u64,
    pub fallbacks: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    errors: AtomicU64,
    fallbacks: AtomicU64,
}

/// Sends requests to an [`InferenceProvider`] under the retry policy.
pub struct Dispatcher {
    provider: Arc<dyn InferenceProvider>,
    retry: RetryConfig,
    request_timeout: Duration,
    fallback_model: Option<String>,
    breaker: Option<CircuitBreaker>,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn InferenceProvider>, retry: RetryConfig) -> Self {
        Self {
            provider,
            retry,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fallback_model: None,
            breaker: None,
            counters: Counters::default(),
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Model to try when the requested one is not found.
    pub fn fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(CircuitBreaker::new(config));
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Bound on each provider call, and on each gap between stream chunks.
    pub fn timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Breaker state, if a breaker is configured.
    pub fn circuit(&self) -> Option<CircuitSnapshot> {
        self.breaker.as_ref().map(CircuitBreaker::snapshot)
    }

    pub fn reset_circuit(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.reset();
        }
    }

    /// Non-streaming completion. Returns the provider's raw JSON.
    #[instrument(skip(self, model, messages, params), fields(operation = "chat", model = %model))]
    pub async fn dispatch(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Dispatched<Value>> {
        self.run("chat", model, move |model: String| async move {
            self.provider.complete(&model, messages, params).await
        })
        .await
    }

    /// Streaming completion. Only establishing the stream is retried;
    /// failures after the first byte belong to the consumer, which should
    /// bound the body with [`timeout`](Self::timeout).
    #[instrument(skip(self, model, messages, params), fields(operation = "chat_stream", model = %model))]
    pub async fn dispatch_stream(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Dispatched<ByteStream>> {
        self.run("chat_stream", model, move |model: String| async move {
            self.provider.complete_stream(&model, messages, params).await
        })
        .await
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        model: &str,
        call: F,
    ) -> Result<Dispatched<T>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        if let Some(breaker) = &self.breaker {
            if let Err(e) = breaker.acquire() {
                metrics::counter!(telemetry::CIRCUIT_REJECTIONS_TOTAL,
                    "provider" => self.provider.name().to_owned(),
                )
                .increment(1);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }

        let start = Instant::now();
        let mut result = self.attempt(operation, model, &call).await.map(|value| Dispatched {
            value,
            model: model.to_string(),
            used_fallback: false,
        });

        let fallback = match (&result, &self.fallback_model) {
            (Err(e), Some(fallback)) if e.is_fallback_trigger() && fallback != model => {
                Some(fallback.as_str())
            }
            _ => None,
        };
        if let Some(fallback) = fallback {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::FALLBACKS_TOTAL,
                "provider" => self.provider.name().to_owned(),
            )
            .increment(1);
            info!(primary = model, fallback, "primary model unavailable, using fallback");
            result = self
                .attempt(operation, fallback, &call)
                .await
                .map(|value| Dispatched {
                    value,
                    model: fallback.to_string(),
                    used_fallback: true,
                });
        }

        if let Some(breaker) = &self.breaker {
            match &result {
                Err(e) if e.is_transient() => breaker.on_failure(),
                _ => breaker.on_success(),
            }
        }

        self.record_request(operation, start, result.is_ok());
        if let Err(e) = &result {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(operation, model, error = %e, "dispatch failed");
        }
        result
    }

    async fn attempt<T, F, Fut>(&self, operation: &'static str, model: &str, call: &F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.request_timeout;
        with_retry(&self.retry, self.provider.name(), operation, move || async move {
            tokio::time::timeout(timeout, call(model.to_string()))
                .await
                .map_err(|_| RelayError::Timeout(timeout))?
        })
        .await
    }

    fn record_request(&self, operation: &'static str, start: Instant, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        metrics::counter!(telemetry::REQUESTS_TOTAL,
            "provider" => self.provider.name().to_owned(),
            "operation" => operation,
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
            "provider" => self.provider.name().to_owned(),
            "operation" => operation,
        )
        .record(start.elapsed().as_secs_f64());
    }
}
