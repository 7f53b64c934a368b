//! Streaming responses: SSE decoding, delta extraction, accumulation.

pub mod accumulator;
pub mod delta;
pub mod sse;

pub use accumulator::{CompletionHook, DeltaStream, collect_text};
pub use delta::extract_delta;
pub use sse::{SseDecoder, SseFrame};
