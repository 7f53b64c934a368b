//! End-to-end pipeline behavior: validation, cache tiers, rate limiting,
//! single-flight, streaming and conversation persistence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};

use chatrelay::cache::{DurableStore, MemoryStore, PutOptions};
use chatrelay::providers::{ByteStream, InferenceProvider};
use chatrelay::ratelimit::RateLimitConfig;
use chatrelay::session::MemorySessionStore;
use chatrelay::stream::collect_text;
use chatrelay::types::{CacheTier, ChatRequest, GenerationParams, Message, Role};
use chatrelay::{
    CacheConfig, ChatPipeline, ChatRelay, ErrorKind, OperationPolicy, RelayBuilder, RelayError,
    Result, RetryConfig,
};

// ============================================================================
// Mock provider
// ============================================================================

/// Echoes the last message; streams a fixed chunk script.
struct Echo {
    calls: AtomicU32,
    stream_calls: AtomicU32,
    delay: Duration,
    chunks: Vec<Result<Bytes>>,
}

impl Echo {
    fn new() -> Arc<Self> {
        Self::with_chunks(Vec::new())
    }

    fn with_chunks(chunks: Vec<Result<Bytes>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            stream_calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            chunks,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            stream_calls: AtomicU32::new(0),
            delay,
            chunks: Vec::new(),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceProvider for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(
        &self,
        _model: &str,
        messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(json!({
            "choices": [{ "message": { "role": "assistant", "content": format!("echo: {last}") } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 }
        }))
    }

    async fn complete_stream(
        &self,
        _model: &str,
        _messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<ByteStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(futures_util::stream::iter(self.chunks.clone())))
    }
}

/// Durable store whose every operation fails.
struct BrokenStore;

#[async_trait]
impl DurableStore for BrokenStore {
    fn name(&self) -> &str {
        "broken"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(RelayError::Cache("unreachable".into()))
    }

    async fn put(&self, _key: &str, _value: String, _options: PutOptions) -> Result<()> {
        Err(RelayError::Cache("unreachable".into()))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(RelayError::Cache("unreachable".into()))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(RelayError::Cache("unreachable".into()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn builder(provider: Arc<Echo>) -> RelayBuilder {
    ChatRelay::builder()
        .provider(provider)
        .retry(RetryConfig::disabled())
}

fn ask(text: &str) -> ChatRequest {
    ChatRequest::new(vec![Message::system("be brief"), Message::user(text)])
}

async fn complete(relay: &ChatPipeline, request: ChatRequest) -> chatrelay::ResponseEnvelope {
    relay
        .chat(request)
        .await
        .unwrap()
        .into_complete()
        .expect("complete response")
}

fn sse(chunks: &[&str]) -> Vec<Result<Bytes>> {
    chunks
        .iter()
        .map(|c| Ok(Bytes::from(c.to_string())))
        .collect()
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn repeated_request_is_served_from_local_cache() {
    let provider = Echo::new();
    let relay = builder(provider.clone()).build().unwrap();

    let first = complete(&relay, ask("hello")).await;
    assert_eq!(first.text, "echo: hello");
    assert!(!first.cached);
    assert_eq!(first.cache_tier, None);

    let second = complete(&relay, ask("hello")).await;
    assert_eq!(second.text, "echo: hello");
    assert!(second.cached);
    assert_eq!(second.cache_tier, Some(CacheTier::Local));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn different_parameters_miss_the_cache() {
    let provider = Echo::new();
    let relay = builder(provider.clone()).build().unwrap();

    complete(&relay, ask("hello")).await;
    complete(
        &relay,
        ask("hello").params(GenerationParams::default().temperature(0.2)),
    )
    .await;
    complete(&relay, ask("hello").model("@cf/other/model")).await;

    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn expired_entry_is_dispatched_again() {
    let provider = Echo::new();
    let relay = builder(provider.clone())
        .cache(CacheConfig::new().ttl(Duration::from_secs(1)))
        .build()
        .unwrap();

    complete(&relay, ask("hello")).await;
    assert!(complete(&relay, ask("hello")).await.cached);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let after = complete(&relay, ask("hello")).await;
    assert!(!after.cached);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn durable_tier_is_shared_between_instances() {
    let store = Arc::new(MemoryStore::new());
    let first_provider = Echo::new();
    let second_provider = Echo::new();

    let first = builder(first_provider.clone())
        .durable_store(store.clone())
        .build()
        .unwrap();
    let second = builder(second_provider.clone())
        .durable_store(store.clone())
        .build()
        .unwrap();

    complete(&first, ask("shared")).await;
    assert_eq!(store.len(), 1);

    let hit = complete(&second, ask("shared")).await;
    assert!(hit.cached);
    assert_eq!(hit.cache_tier, Some(CacheTier::Durable));
    assert_eq!(second_provider.calls(), 0);

    // backfilled into the second instance's local tier
    let again = complete(&second, ask("shared")).await;
    assert_eq!(again.cache_tier, Some(CacheTier::Local));
}

#[tokio::test]
async fn failing_durable_tier_degrades_to_local() {
    let provider = Echo::new();
    let relay = builder(provider.clone())
        .durable_store(Arc::new(BrokenStore))
        .build()
        .unwrap();

    let fresh = complete(&relay, ask("hello")).await;
    assert_eq!(fresh.text, "echo: hello");

    let hit = complete(&relay, ask("hello")).await;
    assert_eq!(hit.cache_tier, Some(CacheTier::Local));
    assert_eq!(provider.calls(), 1);

    relay.clear_cache(true).await;
    assert!(!complete(&relay, ask("hello")).await.cached);
}

#[tokio::test]
async fn clear_cache_can_include_durable_tier() {
    let store = Arc::new(MemoryStore::new());
    let relay = builder(Echo::new())
        .durable_store(store.clone())
        .build()
        .unwrap();

    complete(&relay, ask("a")).await;
    complete(&relay, ask("b")).await;
    assert_eq!(store.len(), 2);

    relay.clear_cache(false).await;
    assert_eq!(store.len(), 2);
    assert_eq!(
        complete(&relay, ask("a")).await.cache_tier,
        Some(CacheTier::Durable)
    );

    relay.clear_cache(true).await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn salted_keys_differ_between_deployments() {
    let store = Arc::new(MemoryStore::new());
    let salted_provider = Echo::new();

    let plain = builder(Echo::new())
        .durable_store(store.clone())
        .build()
        .unwrap();
    let salted = builder(salted_provider.clone())
        .durable_store(store.clone())
        .cache_salt("pepper")
        .build()
        .unwrap();

    complete(&plain, ask("hello")).await;
    let reply = complete(&salted, ask("hello")).await;

    assert!(!reply.cached);
    assert_eq!(salted_provider.calls(), 1);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn rate_limiter_rejects_past_budget_but_not_cache_hits() {
    let provider = Echo::new();
    let relay = builder(provider.clone())
        .rate_limit(RateLimitConfig::per_minute(2))
        .build()
        .unwrap();

    complete(&relay, ask("one")).await;
    complete(&relay, ask("two")).await;

    let err = relay.chat(ask("three")).await.unwrap_err();
    assert!(matches!(err, RelayError::RateLimited { .. }));
    assert_eq!(err.status_code(), 429);
    assert!(err.retry_after().is_some());

    // hits never reach the limiter
    assert!(complete(&relay, ask("one")).await.cached);
    assert_eq!(provider.calls(), 2);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn invalid_payload_never_reaches_provider() {
    let provider = Echo::new();
    let relay = builder(provider.clone()).build().unwrap();

    let err = relay
        .handle(&json!({ "messages": [{ "role": "wizard", "content": "hi" }] }))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.status_code(), 400);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn direct_payload_is_dispatched() {
    let provider = Echo::new();
    let relay = builder(provider.clone()).build().unwrap();

    let envelope = relay
        .handle(&json!({
            "messages": [{ "role": "user", "content": "direct" }],
            "temperature": 0.5
        }))
        .await
        .unwrap()
        .into_complete()
        .unwrap();

    assert_eq!(envelope.text, "echo: direct");
    assert_eq!(envelope.model.as_deref(), Some(chatrelay::gateway::DEFAULT_MODEL));
}

#[tokio::test]
async fn unknown_operation_gets_empty_success_when_lenient() {
    let provider = Echo::new();
    let relay = builder(provider.clone()).build().unwrap();

    let envelope = relay
        .handle_slice(br#"{"operationName":"availableAgents","variables":{}}"#)
        .await
        .unwrap()
        .into_complete()
        .unwrap();

    assert_eq!(envelope.text, "");
    assert!(!envelope.cached);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn unknown_operation_is_rejected_when_strict() {
    let relay = builder(Echo::new())
        .operation_policy(OperationPolicy::Strict)
        .build()
        .unwrap();

    let err = relay
        .handle(&json!({ "operationName": "availableAgents" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ============================================================================
// Single-flight
// ============================================================================

#[tokio::test]
async fn concurrent_identical_misses_share_one_dispatch() {
    let provider = Echo::slow(Duration::from_millis(50));
    let relay = builder(provider.clone())
        .single_flight(true)
        .build()
        .unwrap();

    let (a, b, c) = tokio::join!(
        relay.chat(ask("same")),
        relay.chat(ask("same")),
        relay.chat(ask("same")),
    );

    for output in [a, b, c] {
        assert_eq!(output.unwrap().into_complete().unwrap().text, "echo: same");
    }
    assert_eq!(provider.calls(), 1);
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn stream_reconstructs_text_and_caches_on_done() {
    let provider = Echo::with_chunks(sse(&[
        "data: {\"response\":\"Hel",
        "lo\"}\n\ndata: {\"response\":\" \"}\n",
        "\ndata: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
        "data: [DONE]\n\n",
    ]));
    let relay = builder(provider.clone()).build().unwrap();

    let stream = relay
        .chat(ask("greet").stream(true))
        .await
        .unwrap()
        .into_stream()
        .expect("stream response");
    assert_eq!(stream.model, chatrelay::gateway::DEFAULT_MODEL);

    let deltas: Vec<String> = stream
        .deltas
        .map(|d| d.unwrap())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(deltas, vec!["Hello", " ", "world"]);

    // streamed requests hit the cache as complete responses
    let cached = complete(&relay, ask("greet").stream(true)).await;
    assert!(cached.cached);
    assert_eq!(cached.text, "Hello world");

    let same_non_streaming = complete(&relay, ask("greet")).await;
    assert!(same_non_streaming.cached);
    assert_eq!(provider.stream_calls(), 1);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn interrupted_stream_is_not_cached() {
    let mut chunks = sse(&["data: {\"response\":\"partial\"}\n\n"]);
    chunks.push(Err(RelayError::Stream("connection reset".into())));
    let provider = Echo::with_chunks(chunks);
    let relay = builder(provider.clone()).build().unwrap();

    let stream = relay
        .chat(ask("greet").stream(true))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    let err = collect_text(stream.deltas).await.unwrap_err();
    assert!(matches!(err, RelayError::Stream(_)));

    let retry = relay.chat(ask("greet").stream(true)).await.unwrap();
    assert!(retry.into_stream().is_some(), "must not be served from cache");
    assert_eq!(provider.stream_calls(), 2);
}

#[tokio::test]
async fn streamed_miss_envelope_is_marked_streaming() {
    let provider = Echo::with_chunks(sse(&[
        "data: {\"response\":\"hi\"}\n\n",
        "data: [DONE]\n\n",
    ]));
    let relay = builder(provider).build().unwrap();

    let stream = relay
        .chat(ask("greet").stream(true))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    let head = stream.envelope();
    assert!(head.streaming);
    assert!(!head.cached);
    assert_eq!(head.model.as_deref(), Some(chatrelay::gateway::DEFAULT_MODEL));

    let envelope = stream.collect().await.unwrap();
    assert!(envelope.streaming);
    assert!(!envelope.cached);
    assert_eq!(envelope.text, "hi");

    let hit = complete(&relay, ask("greet").stream(true)).await;
    assert!(hit.cached);
    assert!(!hit.streaming);
}

#[tokio::test]
async fn stream_closed_before_done_is_an_error_and_not_cached() {
    let provider = Echo::with_chunks(sse(&["data: {\"response\":\"half\"}\n\n"]));
    let relay = builder(provider.clone()).build().unwrap();

    let stream = relay
        .chat(ask("greet").stream(true))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert!(matches!(stream.collect().await, Err(RelayError::Stream(_))));

    let again = relay.chat(ask("greet").stream(true)).await.unwrap();
    assert!(again.into_stream().is_some());
    assert_eq!(provider.stream_calls(), 2);
}

/// Sends one delta, then never another byte.
struct Stalled;

#[async_trait]
impl InferenceProvider for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn complete(
        &self,
        _model: &str,
        _messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<Value> {
        Ok(json!({ "response": "unused" }))
    }

    async fn complete_stream(
        &self,
        _model: &str,
        _messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<ByteStream> {
        let first = futures_util::stream::iter(vec![Ok(Bytes::from_static(
            b"data: {\"response\":\"a\"}\n\n",
        ))]);
        Ok(Box::pin(first.chain(futures_util::stream::pending())))
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_times_out_after_request_timeout() {
    let relay = ChatRelay::builder()
        .provider(Arc::new(Stalled))
        .request_timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    let mut stream = relay
        .chat(ask("greet").stream(true))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.deltas.next().await.unwrap().unwrap(), "a");

    let started = tokio::time::Instant::now();
    let next = stream.deltas.next().await;
    assert!(matches!(next, Some(Err(RelayError::Timeout(_)))));
    assert!(started.elapsed() <= Duration::from_secs(2));
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn thread_conversation_is_persisted() {
    let relay = builder(Echo::new())
        .session_store(Arc::new(MemorySessionStore::default()))
        .build()
        .unwrap();

    let payload = json!({
        "operationName": "generateCopilotResponse",
        "variables": { "data": {
            "threadId": "thread-1",
            "messages": [
                { "textMessage": { "role": "user", "content": "remember me" } }
            ]
        }}
    });
    relay.handle(&payload).await.unwrap();

    let history = relay.history("thread-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], Message::user("remember me"));
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "echo: remember me");

    assert!(relay.history("unknown").await.unwrap().is_empty());
}

#[tokio::test]
async fn requests_without_thread_are_not_persisted() {
    let sessions = Arc::new(MemorySessionStore::default());
    let relay = builder(Echo::new())
        .session_store(sessions.clone())
        .build()
        .unwrap();

    complete(&relay, ask("hello")).await;
    assert_eq!(sessions.session_count(), 0);
}

// ============================================================================
// Builder
// ============================================================================

#[test]
fn builder_without_provider_fails() {
    let err = ChatRelay::builder().build().err().unwrap();
    assert!(matches!(err, RelayError::NoProvider));
}

#[test]
fn builder_rejects_empty_default_model() {
    let err = builder(Echo::new()).default_model("  ").build().err().unwrap();
    assert!(matches!(err, RelayError::Configuration(_)));
}
