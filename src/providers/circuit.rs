//! Three-state circuit breaker.
//!
//! `Closed` lets every call through and counts consecutive failures. At
//! `failure_threshold` it trips to `Open`, which rejects calls until
//! `cooldown` has passed. The first caller after the cooldown becomes the
//! `HalfOpen` trial: its success closes the breaker, its failure reopens it.
//! Other callers are rejected while the trial is running.
//!
//! Uses `tokio::time::Instant`, so tests can drive it with a paused clock.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{RelayError, Result};

/// Breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed dispatches before opening. Default: 5.
    pub failure_threshold: u32,
    /// How long to stay open. Default: 30s.
    #[serde(deserialize_with = "secs")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

fn secs<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time left before an open breaker admits a trial.
    pub open_remaining: Option<Duration>,
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

impl State {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::closed()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to make a call. Fails with [`RelayError::CircuitOpen`] while open.
    pub fn acquire(&self) -> Result<()> {
        let now = Instant::now();
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = st.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.cooldown {
                    info!("circuit half-open, admitting trial call");
                    st.state = CircuitState::HalfOpen;
                    st.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(RelayError::CircuitOpen {
                        retry_after: self.config.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                // A trial abandoned mid-flight must not wedge the breaker.
                let stale = st
                    .trial_started
                    .is_none_or(|t| now.saturating_duration_since(t) >= self.config.cooldown);
                if stale {
                    st.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(RelayError::CircuitOpen {
                        retry_after: self.config.cooldown,
                    })
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut st = self.lock();
        if st.state != CircuitState::Closed {
            info!("circuit closed");
        }
        *st = State::closed();
    }

    pub fn on_failure(&self) {
        let mut st = self.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        // late failures from calls admitted before the trip keep the
        // original cooldown
        if st.state == CircuitState::Open {
            return;
        }
        let trip = st.state == CircuitState::HalfOpen
            || st.consecutive_failures >= self.config.failure_threshold;
        if trip {
            warn!(
                consecutive_failures = st.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit opened"
            );
            st.state = CircuitState::Open;
            st.opened_at = Some(Instant::now());
            st.trial_started = None;
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        *self.lock() = State::closed();
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let open_remaining = match (st.state, st.opened_at) {
            (CircuitState::Open, Some(at)) => self
                .config
                .cooldown
                .checked_sub(now.saturating_duration_since(at))
                .filter(|d| !d.is_zero()),
            _ => None,
        };
        CircuitSnapshot {
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            open_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .failure_threshold(threshold)
                .cooldown(Duration::from_secs(10)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold() {
        let cb = breaker(3);
        cb.on_failure();
        cb.on_failure();
        assert!(cb.acquire().is_ok());
        cb.on_failure();
        let err = cb.acquire().unwrap_err();
        assert!(matches!(err, RelayError::CircuitOpen { .. }));
        assert_eq!(cb.snapshot().state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_count() {
        let cb = breaker(3);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_trial() {
        let cb = breaker(1);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(cb.acquire().is_ok());
        assert_eq!(cb.snapshot().state, CircuitState::HalfOpen);
        assert!(cb.acquire().is_err());

        cb.on_success();
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
        assert!(cb.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let cb = breaker(5);
        for _ in 0..5 {
            cb.on_failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.acquire().is_ok());
        cb.on_failure();

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.open_remaining, Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn open_reports_remaining_cooldown() {
        let cb = breaker(1);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(4)).await;
        match cb.acquire() {
            Err(RelayError::CircuitOpen { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(6))
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_does_not_extend_cooldown() {
        let cb = breaker(1);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(6)).await;

        cb.on_failure();
        assert_eq!(
            cb.snapshot().open_remaining,
            Some(Duration::from_secs(4))
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cb.acquire().is_ok());
        assert_eq!(cb.snapshot().state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes() {
        let cb = breaker(1);
        cb.on_failure();
        cb.reset();
        assert!(cb.acquire().is_ok());
    }
}
