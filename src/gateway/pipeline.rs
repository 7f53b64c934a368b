//! The request pipeline.
//!
//! ```text
//! raw JSON ─► validate ─► cache key ─► TieredCache::get ──hit──► envelope (cached)
//!                                           │ miss
//!                                           ▼
//!                                     rate limiter ──full──► RateLimited
//!                                           │
//!                         ┌─────── stream? ─┴─ no ───────────────┐
//!                         ▼                                      ▼
//!                 dispatch_stream                     [single-flight] dispatch
//!                         │                                      │
//!             DeltaStream (cache on [DONE])          normalize ─► cache put
//!                         │                                      │
//!                         ▼                                      ▼
//!                 RelayOutput::Stream                  RelayOutput::Complete
//! ```
//!
//! One `ChatPipeline` owns every piece of mutable state (cache tiers, rate
//! windows, breaker, counters) and is shared by handlers behind an `Arc`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheKey, CacheKeyGenerator, CachedResponse, SingleFlight, TieredCache};
use crate::normalize::{extract_usage, normalize};
use crate::providers::{CircuitSnapshot, DispatchStats, Dispatcher};
use crate::ratelimit::FixedWindowLimiter;
use crate::session::SessionStore;
use crate::stream::{CompletionHook, DeltaStream, collect_text};
use crate::telemetry;
use crate::types::{ChatRequest, Message, ResponseEnvelope, Usage};
use crate::validation::{self, OperationPolicy, Validated, ValidationLimits};
use crate::Result;

/// What the pipeline hands back.
pub enum RelayOutput {
    /// A full response, fresh or cached.
    Complete(ResponseEnvelope),
    /// A live stream of text deltas.
    Stream(RelayStream),
}

impl std::fmt::Debug for RelayOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayOutput::Complete(envelope) => f.debug_tuple("Complete").field(envelope).finish(),
            RelayOutput::Stream(stream) => f
                .debug_struct("Stream")
                .field("model", &stream.model)
                .finish_non_exhaustive(),
        }
    }
}

/// A streaming response and the model serving it.
pub struct RelayStream {
    pub model: String,
    pub deltas: DeltaStream,
}

impl RelayStream {
    /// Envelope metadata for this stream, without text.
    pub fn envelope(&self) -> ResponseEnvelope {
        ResponseEnvelope::streamed("", self.model.clone())
    }

    /// Drain the deltas into a streaming envelope. Fails if the upstream
    /// was interrupted before its end sentinel.
    pub async fn collect(self) -> Result<ResponseEnvelope> {
        let text = collect_text(self.deltas).await?;
        Ok(ResponseEnvelope::streamed(text, self.model))
    }
}

impl RelayOutput {
    /// The envelope, if this is a complete response.
    pub fn into_complete(self) -> Option<ResponseEnvelope> {
        match self {
            RelayOutput::Complete(envelope) => Some(envelope),
            RelayOutput::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<RelayStream> {
        match self {
            RelayOutput::Stream(stream) => Some(stream),
            RelayOutput::Complete(_) => None,
        }
    }
}

/// Validates, caches, rate-limits and dispatches chat requests.
///
/// Built with [`ChatRelay::builder()`](super::ChatRelay::builder).
pub struct ChatPipeline {
    pub(super) dispatcher: Dispatcher,
    pub(super) cache: Arc<TieredCache>,
    pub(super) keys: CacheKeyGenerator,
    pub(super) limiter: Option<FixedWindowLimiter>,
    pub(super) flight: Option<SingleFlight<CachedResponse>>,
    pub(super) sessions: Option<Arc<dyn SessionStore>>,
    pub(super) limits: ValidationLimits,
    pub(super) policy: OperationPolicy,
    pub(super) default_model: String,
}

impl ChatPipeline {
    /// Handle an inbound JSON payload in either accepted shape.
    #[instrument(skip(self, raw), fields(operation = "handle"))]
    pub async fn handle(&self, raw: &Value) -> Result<RelayOutput> {
        let validated = validation::validate(raw, &self.limits, self.policy)?;
        self.process(validated).await
    }

    /// Handle raw request bytes; the size limit is checked before parsing.
    #[instrument(skip(self, body), fields(operation = "handle", bytes = body.len()))]
    pub async fn handle_slice(&self, body: &[u8]) -> Result<RelayOutput> {
        let validated = validation::validate_slice(body, &self.limits, self.policy)?;
        self.process(validated).await
    }

    async fn process(&self, validated: Validated) -> Result<RelayOutput> {
        match validated {
            Validated::Empty { operation } => {
                debug!(operation, "acknowledging operation with empty response");
                Ok(RelayOutput::Complete(ResponseEnvelope::empty()))
            }
            Validated::Chat(request) => self.chat(request).await,
        }
    }

    /// Run an already-validated request through cache, limiter and dispatch.
    pub async fn chat(&self, request: ChatRequest) -> Result<RelayOutput> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let key = self.keys.key(&model, &request.messages, &request.params);

        if let Some((hit, tier)) = self.cache.get(&key).await {
            debug!(key = %key, tier = tier.as_str(), "cache hit");
            self.persist_exchange(&request, &hit.text).await;
            let served_by = hit.model.or(Some(model));
            return Ok(RelayOutput::Complete(ResponseEnvelope::from_cache(
                hit.text, served_by, tier,
            )));
        }

        if let Some(limiter) = &self.limiter {
            limiter.try_acquire()?;
        }

        if request.stream {
            return self.stream(request, model, key).await;
        }

        let response = match &self.flight {
            Some(flight) => {
                flight
                    .run(key.as_str(), || self.complete(&request, &model, &key))
                    .await?
            }
            None => self.complete(&request, &model, &key).await?,
        };

        self.persist_exchange(&request, &response.text).await;
        let served_by = response.model.unwrap_or(model);
        Ok(RelayOutput::Complete(ResponseEnvelope::fresh(
            response.text,
            served_by,
        )))
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        model: &str,
        key: &CacheKey,
    ) -> Result<CachedResponse> {
        let dispatched = self
            .dispatcher
            .dispatch(model, &request.messages, &request.params)
            .await?;
        let text = normalize(&dispatched.value)?;
        if let Some(usage) = extract_usage(&dispatched.value) {
            self.record_token_usage(&usage);
        }

        let response = CachedResponse {
            text,
            model: Some(dispatched.model),
        };
        self.cache.put(key, response.clone(), None).await;
        Ok(response)
    }

    async fn stream(&self, request: ChatRequest, model: String, key: CacheKey) -> Result<RelayOutput> {
        let dispatched = self
            .dispatcher
            .dispatch_stream(&model, &request.messages, &request.params)
            .await?;

        let cache = self.cache.clone();
        let sessions = self.sessions.clone();
        let served_by = dispatched.model.clone();
        let hook: CompletionHook = Box::new(move |text: String| {
            Box::pin(async move {
                let response = CachedResponse {
                    text,
                    model: Some(served_by),
                };
                cache.put(&key, response.clone(), None).await;
                if let Some(store) = sessions {
                    append_exchange(store.as_ref(), &request, &response.text).await;
                }
            })
        });

        Ok(RelayOutput::Stream(RelayStream {
            model: dispatched.model,
            deltas: DeltaStream::bounded(dispatched.value, hook, self.dispatcher.timeout()),
        }))
    }

    async fn persist_exchange(&self, request: &ChatRequest, reply: &str) {
        if let Some(store) = &self.sessions {
            append_exchange(store.as_ref(), request, reply).await;
        }
    }

    fn record_token_usage(&self, usage: &Usage) {
        let provider = self.dispatcher.provider_name().to_owned();
        metrics::counter!(telemetry::TOKENS_TOTAL,
            "provider" => provider.clone(),
            "direction" => "prompt",
        )
        .increment(u64::from(usage.prompt_tokens));
        metrics::counter!(telemetry::TOKENS_TOTAL,
            "provider" => provider,
            "direction" => "completion",
        )
        .increment(u64::from(usage.completion_tokens));
    }

    /// Empty the local tier, and the durable tier when `include_durable`.
    pub async fn clear_cache(&self, include_durable: bool) {
        self.cache.clear(include_durable).await;
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn circuit(&self) -> Option<CircuitSnapshot> {
        self.dispatcher.circuit()
    }

    /// Stored conversation for `thread_id`; empty when persistence is off.
    pub async fn history(&self, thread_id: &str) -> Result<Vec<Message>> {
        match &self.sessions {
            Some(store) => store.get(thread_id).await,
            None => Ok(Vec::new()),
        }
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn provider_name(&self) -> &str {
        self.dispatcher.provider_name()
    }
}

/// Append the latest prompt and the reply to the conversation log.
/// Failures are logged only.
async fn append_exchange(store: &dyn SessionStore, request: &ChatRequest, reply: &str) {
    let Some(thread_id) = request.thread_id.as_deref() else {
        return;
    };

    let prompt = request.messages.last().cloned();
    for message in prompt.into_iter().chain([Message::assistant(reply)]) {
        if let Err(e) = store.append(thread_id, message).await {
            warn!(thread_id, error = %e, "failed to persist conversation");
            return;
        }
    }
}
