//! Outbound side of the relay.
//!
//! [`InferenceProvider`] is the seam to a remote inference API;
//! [`WorkersAiClient`] is the shipped implementation. [`Dispatcher`] wraps a
//! provider with timeouts, retry with jittered backoff, fallback-model
//! substitution and an optional [`CircuitBreaker`].

pub mod circuit;
pub mod dispatcher;
pub mod endpoint;
pub mod retry;
pub mod traits;
pub mod workers_ai;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use dispatcher::{DEFAULT_REQUEST_TIMEOUT, DispatchStats, Dispatched, Dispatcher};
pub use endpoint::EndpointProbe;
pub use retry::RetryConfig;
pub use traits::{ByteStream, InferenceProvider};
pub use workers_ai::{EndpointKind, WorkersAiClient};
