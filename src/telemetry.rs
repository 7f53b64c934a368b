//! Telemetry metric name constants.
//!
//! Centralised metric names for relay operations. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops and pipeline behaviour is
//! unchanged.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `chatrelay_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider`: provider name (e.g. "workers-ai")
//! - `operation`: "chat" or "chat_stream"
//! - `status`: outcome: "ok" or "error"
//! - `tier`: cache tier: "local" or "durable"

/// Total dispatches to the provider (after cache and rate limiting).
///
/// Labels: `provider`, `operation`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "chatrelay_requests_total";

/// Dispatch duration in seconds, including retries and fallback.
///
/// Labels: `provider`, `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "chatrelay_request_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `provider`, `operation`.
pub const RETRIES_TOTAL: &str = "chatrelay_retries_total";

/// Total dispatches that switched to the fallback model.
///
/// Labels: `provider`.
pub const FALLBACKS_TOTAL: &str = "chatrelay_fallbacks_total";

/// Total requests rejected before dispatch because the breaker was open.
///
/// Labels: `provider`.
pub const CIRCUIT_REJECTIONS_TOTAL: &str = "chatrelay_circuit_rejections_total";

/// Total cache hits.
///
/// Labels: `tier` ("local" | "durable").
pub const CACHE_HITS_TOTAL: &str = "chatrelay_cache_hits_total";

/// Total cache misses (both tiers missed).
pub const CACHE_MISSES_TOTAL: &str = "chatrelay_cache_misses_total";

/// Durable tier failures swallowed by the cache.
///
/// Labels: `op` ("get" | "put" | "list" | "delete").
pub const CACHE_TIER_ERRORS_TOTAL: &str = "chatrelay_cache_tier_errors_total";

/// Requests rejected by the local rate limiter.
pub const RATE_LIMITED_TOTAL: &str = "chatrelay_rate_limited_total";

/// Text deltas delivered to streaming consumers.
pub const STREAM_DELTAS_TOTAL: &str = "chatrelay_stream_deltas_total";

/// Total tokens reported by the provider.
///
/// Labels: `direction` ("prompt" | "completion").
pub const TOKENS_TOTAL: &str = "chatrelay_tokens_total";
