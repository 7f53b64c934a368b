//! Provider trait for remote inference backends.
//!
//! A provider knows how to reach one inference API. It does not retry, time
//! out, or fall back; the [`Dispatcher`](super::Dispatcher) layers those on
//! top. Providers report failures through [`RelayError`](crate::RelayError)
//! so the dispatcher can classify them:
//!
//! - `ModelNotFound` / `Api { status: 404 }` may trigger the fallback model
//! - `Http`, `Timeout`, `RateLimited`, `Api { 5xx | 429 }` are retried
//! - everything else is returned as-is

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::Result;
use crate::types::{GenerationParams, Message};

/// Raw response body chunks of a streaming call.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A remote chat inference API.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Provider name for logging and metrics.
    fn name(&self) -> &str;

    /// Non-streaming completion. Returns the provider's JSON body untouched;
    /// [`normalize`](crate::normalize::normalize) extracts the text.
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Value>;

    /// Streaming completion. Resolves once the provider has accepted the
    /// request; the body is an event stream of `data:` frames.
    async fn complete_stream(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<ByteStream>;
}
