//! Tests for metrics integration.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{Value, json};

use chatrelay::cache::{DurableStore, PutOptions};
use chatrelay::providers::{ByteStream, Dispatcher, InferenceProvider};
use chatrelay::ratelimit::RateLimitConfig;
use chatrelay::telemetry;
use chatrelay::types::{ChatRequest, GenerationParams, Message};
use chatrelay::{ChatRelay, RelayError, Result, RetryConfig};

// ============================================================================
// Mock providers
// ============================================================================

struct Answering;

#[async_trait]
impl InferenceProvider for Answering {
    fn name(&self) -> &str {
        "answering"
    }

    async fn complete(
        &self,
        _model: &str,
        _messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<Value> {
        Ok(json!({
            "response": "ok",
            "usage": { "prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5 }
        }))
    }

    async fn complete_stream(
        &self,
        _model: &str,
        _messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<ByteStream> {
        Err(RelayError::Stream("unused".into()))
    }
}

struct Overloaded;

#[async_trait]
impl InferenceProvider for Overloaded {
    fn name(&self) -> &str {
        "overloaded"
    }

    async fn complete(
        &self,
        _model: &str,
        _messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<Value> {
        Err(RelayError::Api {
            status: 503,
            message: "busy".into(),
        })
    }

    async fn complete_stream(
        &self,
        _model: &str,
        _messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<ByteStream> {
        Err(RelayError::Stream("unused".into()))
    }
}

struct BrokenStore;

#[async_trait]
impl DurableStore for BrokenStore {
    fn name(&self) -> &str {
        "broken"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(RelayError::Cache("down".into()))
    }

    async fn put(&self, _key: &str, _value: String, _options: PutOptions) -> Result<()> {
        Err(RelayError::Cache("down".into()))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(RelayError::Cache("down".into()))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(RelayError::Cache("down".into()))
    }
}

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    counter_where(snapshot, name, |_| true)
}

/// Sum counters matching `name` and carrying `label = value`.
fn counter_labeled(snapshot: &SnapshotVec, name: &str, label: &str, value: &str) -> u64 {
    counter_where(snapshot, name, |key| {
        key.key()
            .labels()
            .any(|l| l.key() == label && l.value() == value)
    })
}

fn counter_where(
    snapshot: &SnapshotVec,
    name: &str,
    pred: impl Fn(&metrics_util::CompositeKey) -> bool,
) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| {
            key.kind() == MetricKind::Counter && key.key().name() == name && pred(key)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Check if any histogram entries exist for a given metric name.
fn has_histogram(snapshot: &SnapshotVec, name: &str) -> bool {
    snapshot
        .iter()
        .any(|(key, _, _, _)| key.kind() == MetricKind::Histogram && key.key().name() == name)
}

/// Runs async code within a local recorder scope on the multi-thread runtime.
///
/// `block_in_place` keeps the sync `with_local_recorder` closure on the
/// current thread while `block_on` drives the inner async work.
fn recorded<F: Future>(work: F) -> (F::Output, Snapshotter) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let output = metrics::with_local_recorder(&recorder, || {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(work))
    });
    (output, snapshotter)
}

fn request(text: &str) -> ChatRequest {
    ChatRequest::new(vec![Message::user(text)])
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn successful_dispatch_records_request_and_duration() {
    let (result, snapshotter) = recorded(async {
        let dispatcher = Dispatcher::new(Arc::new(Answering), RetryConfig::disabled());
        dispatcher
            .dispatch("m", &[Message::user("hi")], &GenerationParams::default())
            .await
            .map(|d| d.value)
    });
    assert!(result.is_ok());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::REQUESTS_TOTAL), 1);
    assert_eq!(
        counter_labeled(&snapshot, telemetry::REQUESTS_TOTAL, "status", "ok"),
        1
    );
    assert!(has_histogram(&snapshot, telemetry::REQUEST_DURATION_SECONDS));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn retries_are_counted_per_retry() {
    let (result, snapshotter) = recorded(async {
        let dispatcher = Dispatcher::new(
            Arc::new(Overloaded),
            RetryConfig::new()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(1)),
        );
        dispatcher
            .dispatch("m", &[Message::user("hi")], &GenerationParams::default())
            .await
            .map(|d| d.value)
    });
    assert!(result.is_err());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::RETRIES_TOTAL), 2);
    assert_eq!(
        counter_labeled(&snapshot, telemetry::REQUESTS_TOTAL, "status", "error"),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn cache_hits_and_misses_are_counted_by_tier() {
    let (_, snapshotter) = recorded(async {
        let relay = ChatRelay::builder()
            .provider(Arc::new(Answering))
            .build()
            .unwrap();
        relay.chat(request("a")).await.unwrap();
        relay.chat(request("a")).await.unwrap();
        relay.chat(request("b")).await.unwrap();
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 2);
    assert_eq!(
        counter_labeled(&snapshot, telemetry::CACHE_HITS_TOTAL, "tier", "local"),
        1
    );
    assert_eq!(
        counter_labeled(&snapshot, telemetry::TOKENS_TOTAL, "direction", "prompt"),
        8
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn durable_tier_failures_are_counted() {
    let (result, snapshotter) = recorded(async {
        let relay = ChatRelay::builder()
            .provider(Arc::new(Answering))
            .durable_store(Arc::new(BrokenStore))
            .build()
            .unwrap();
        relay.chat(request("a")).await
    });
    assert!(result.is_ok());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_labeled(&snapshot, telemetry::CACHE_TIER_ERRORS_TOTAL, "op", "get"),
        1
    );
    assert_eq!(
        counter_labeled(&snapshot, telemetry::CACHE_TIER_ERRORS_TOTAL, "op", "put"),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn rate_limit_refusals_are_counted() {
    let (_, snapshotter) = recorded(async {
        let relay = ChatRelay::builder()
            .provider(Arc::new(Answering))
            .rate_limit(RateLimitConfig::per_minute(0))
            .build()
            .unwrap();
        relay.chat(request("a")).await.unwrap_err();
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::RATE_LIMITED_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::REQUESTS_TOTAL), 0);
}

#[tokio::test]
async fn metrics_are_noop_without_recorder() {
    // Verify no panics when no recorder is installed.
    let relay = ChatRelay::builder()
        .provider(Arc::new(Answering))
        .build()
        .unwrap();
    relay.chat(request("hello")).await.unwrap();
}
