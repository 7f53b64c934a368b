//! Retry configuration, delay calculation, and the shared retry loop.
//!
//! [`RetryConfig`] controls how many times a transient failure is retried
//! and how long to wait in between. The dispatcher runs every provider call
//! through [`with_retry()`], keeping retry logic in a single place.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::warn;

use crate::telemetry;
use crate::{RelayError, Result};

/// Configuration for retry behaviour on transient errors.
///
/// Uses exponential backoff with optional jitter:
///
/// ```rust
/// # use chatrelay::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200))
///     .jitter(true);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 500ms.
    #[serde(deserialize_with = "millis::deserialize")]
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    #[serde(deserialize_with = "millis::deserialize")]
    pub max_delay: Duration,
    /// Whether to add random jitter to delays. Default: true.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the base delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Deterministic part of the delay after attempt `attempt` (0-indexed):
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Bounds of the delay after attempt `attempt`, jitter included.
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter {
            return (base, base);
        }
        let upper = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .saturating_add(self.initial_delay)
            .min(self.max_delay);
        (base, upper)
    }

    /// Delay to sleep after attempt `attempt`.
    ///
    /// A provider `retry_after` hint replaces the computed backoff, still
    /// capped at `max_delay`. Otherwise `initial * 2^attempt + U(0, initial)`
    /// when jitter is on.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }

        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.jitter {
            let max_ms = self.initial_delay.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
        } else {
            Duration::ZERO
        };
        base.saturating_add(jitter).min(self.max_delay)
    }
}

/// Execute an async operation with retry logic.
///
/// Retries on transient errors (as classified by [`RelayError::is_transient()`])
/// up to `config.max_attempts`, sleeping [`RetryConfig::effective_delay()`]
/// between attempts. Permanent errors are returned immediately.
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    provider_name: &str,
    operation: &str,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..config.max_attempts.max(1) {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                if attempt + 1 < config.max_attempts {
                    let delay = config.effective_delay(attempt, e.retry_after());
                    metrics::counter!(telemetry::RETRIES_TOTAL,
                        "provider" => provider_name.to_owned(),
                        "operation" => operation.to_owned(),
                    )
                    .increment(1);
                    warn!(
                        provider = provider_name,
                        operation,
                        attempt = attempt + 1,
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(RelayError::NoProvider))
}

/// Durations as integer milliseconds in config files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
