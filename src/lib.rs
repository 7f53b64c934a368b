//! chatrelay - caching, retrying relay between chat frontends and hosted
//! inference APIs
//!
//! A [`ChatPipeline`] accepts chat requests in two inbound shapes, validates
//! them, serves repeats from a two-tier response cache, enforces a
//! per-minute request budget, and dispatches misses to the upstream with
//! retry, fallback and an optional circuit breaker. Streaming responses are
//! relayed as text deltas and cached once the upstream finishes.
//!
//! # Example
//!
//! ```rust,no_run
//! use chatrelay::{ChatRelay, RetryConfig};
//! use chatrelay::types::{ChatRequest, Message};
//!
//! #[tokio::main]
//! async fn main() -> chatrelay::Result<()> {
//!     let relay = ChatRelay::builder()
//!         .workers_ai("your-account-id", "your-api-token")
//!         .retry(RetryConfig::new().max_attempts(3))
//!         .build()?;
//!
//!     let request = ChatRequest::new(vec![
//!         Message::system("You are a helpful assistant."),
//!         Message::user("What is the capital of France?"),
//!     ]);
//!
//!     if let Some(envelope) = relay.chat(request).await?.into_complete() {
//!         println!("{} (cached: {})", envelope.text, envelope.cached);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Raw frontend payloads go through [`ChatPipeline::handle`] instead, which
//! validates either inbound shape first.

pub mod cache;
pub mod error;
pub mod gateway;
pub mod normalize;
pub mod providers;
pub mod ratelimit;
#[cfg(feature = "server")]
pub mod server;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod types;
pub mod validation;
mod version;

pub use cache::CacheConfig;
pub use error::{ErrorKind, RelayError, Result};
pub use gateway::{ChatPipeline, ChatRelay, RelayBuilder, RelayOutput, RelayStream};
pub use providers::{CircuitBreakerConfig, RetryConfig};
pub use ratelimit::RateLimitConfig;
pub use types::{CacheTier, ChatRequest, GenerationParams, Message, ResponseEnvelope, Role};
pub use validation::{OperationPolicy, ValidationLimits};
pub use version::{PKG_NAME, PKG_VERSION};
