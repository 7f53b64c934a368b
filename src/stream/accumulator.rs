//! Delta stream over a provider event stream.
//!
//! [`DeltaStream`] turns the raw response body into text deltas as they
//! arrive while keeping the concatenated text on the side. How it ends
//! decides what happens to that text:
//!
//! | end of body                 | consumer sees              | completion hook |
//! |-----------------------------|----------------------------|-----------------|
//! | `data: [DONE]`              | stream ends                | called          |
//! | transport error             | `Err(RelayError::Stream)`  | not called      |
//! | close without `[DONE]`      | `Err(RelayError::Stream)`  | not called      |
//! | no chunk within idle limit  | `Err(RelayError::Timeout)` | not called      |
//!
//! Only a sentinel-terminated stream counts as complete, so consumers can
//! tell a finished reply from a truncated one. The stream is single-use.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt, stream};
use tracing::{debug, warn};

use super::delta::extract_delta;
use super::sse::{SseDecoder, SseFrame};
use crate::providers::ByteStream;
use crate::telemetry;
use crate::{RelayError, Result};

/// Called once with the full text when the stream completes cleanly.
pub type CompletionHook = Box<dyn FnOnce(String) -> BoxFuture<'static, ()> + Send>;

/// Text deltas decoded from a provider event stream.
pub struct DeltaStream {
    inner: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
}

struct State {
    body: ByteStream,
    decoder: SseDecoder,
    queue: VecDeque<String>,
    text: String,
    hook: Option<CompletionHook>,
    idle_timeout: Option<Duration>,
    /// Reported once the queued deltas are drained.
    pending_error: Option<RelayError>,
    done: bool,
}

impl State {
    /// Queue deltas from `frames`. Returns true once the sentinel is seen;
    /// frames after it are ignored.
    fn absorb(&mut self, frames: impl IntoIterator<Item = SseFrame>) -> bool {
        for frame in frames {
            match frame {
                SseFrame::Data(payload) => {
                    let Some(delta) = extract_delta(&payload) else {
                        continue;
                    };
                    if delta.is_empty() {
                        continue;
                    }
                    metrics::counter!(telemetry::STREAM_DELTAS_TOTAL).increment(1);
                    self.text.push_str(&delta);
                    self.queue.push_back(delta);
                }
                SseFrame::Done => {
                    self.done = true;
                    return true;
                }
            }
        }
        false
    }

    /// Next body chunk, or `Timeout` when the upstream goes quiet.
    async fn next_chunk(&mut self) -> Option<Result<bytes::Bytes>> {
        match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.body.next()).await {
                Ok(chunk) => chunk,
                Err(_) => Some(Err(RelayError::Timeout(limit))),
            },
            None => self.body.next().await,
        }
    }

    fn fail(&mut self, e: RelayError) -> RelayError {
        self.done = true;
        self.queue.clear();
        e
    }

    async fn complete(&mut self) {
        debug!(chars = self.text.len(), "stream complete");
        if let Some(hook) = self.hook.take() {
            hook(std::mem::take(&mut self.text)).await;
        }
    }
}

impl DeltaStream {
    /// Decode `body` without a completion hook.
    pub fn new(body: ByteStream) -> Self {
        Self::build(body, None, None)
    }

    /// Decode `body`, calling `hook` with the full text after `[DONE]`.
    pub fn with_completion(body: ByteStream, hook: CompletionHook) -> Self {
        Self::build(body, Some(hook), None)
    }

    /// Like [`with_completion`](Self::with_completion), failing with
    /// [`RelayError::Timeout`] when no chunk arrives within `idle_timeout`.
    pub fn bounded(body: ByteStream, hook: CompletionHook, idle_timeout: Duration) -> Self {
        Self::build(body, Some(hook), Some(idle_timeout))
    }

    fn build(
        body: ByteStream,
        hook: Option<CompletionHook>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let state = State {
            body,
            decoder: SseDecoder::new(),
            queue: VecDeque::new(),
            text: String::new(),
            hook,
            idle_timeout,
            pending_error: None,
            done: false,
        };

        let inner = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(delta) = st.queue.pop_front() {
                    return Some((Ok(delta), st));
                }
                if let Some(e) = st.pending_error.take() {
                    return Some((Err(e), st));
                }
                if st.done {
                    return None;
                }

                match st.next_chunk().await {
                    Some(Ok(chunk)) => match st.decoder.push(&chunk) {
                        Ok(frames) => {
                            if st.absorb(frames) {
                                st.complete().await;
                            }
                        }
                        Err(e) => {
                            let e = st.fail(e);
                            return Some((Err(e), st));
                        }
                    },
                    Some(Err(e @ RelayError::Timeout(_))) => {
                        warn!(error = %e, "provider stream went idle");
                        let e = st.fail(e);
                        return Some((Err(e), st));
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "provider stream failed mid-flight");
                        let e = match e {
                            RelayError::Stream(_) => e,
                            other => RelayError::Stream(other.to_string()),
                        };
                        let e = st.fail(e);
                        return Some((Err(e), st));
                    }
                    None => {
                        let tail = st.decoder.finish();
                        if st.absorb(tail) {
                            st.complete().await;
                        } else {
                            // deltas decoded from the tail still go out first
                            warn!("provider closed stream without end sentinel, not caching");
                            st.done = true;
                            st.hook = None;
                            let e = RelayError::Stream("upstream closed before [DONE]".into());
                            if st.queue.is_empty() {
                                return Some((Err(e), st));
                            }
                            st.pending_error = Some(e);
                        }
                    }
                }
            }
        });

        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for DeltaStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Drain a delta stream into the full text.
pub async fn collect_text(mut deltas: DeltaStream) -> Result<String> {
    let mut text = String::new();
    while let Some(delta) = deltas.next().await {
        text.push_str(&delta?);
    }
    Ok(text)
}
