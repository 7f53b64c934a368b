//! Fixed-window request limiter.
//!
//! Windows are whole unix minutes. Each accepted check increments the count
//! for its window; once a window's count reaches the limit, further checks in
//! that window are refused until the next minute starts. The limiter is
//! local to the pipeline instance, so with several relay processes each one
//! enforces the limit independently.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;

use crate::cache::local::unix_now;
use crate::{RelayError, Result};

const WINDOW_SECS: u64 = 60;

/// Rate limit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Accepted requests per one-minute window. Default: 60.
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests_per_minute: requests,
        }
    }
}

/// Counts requests per one-minute window.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit: u32,
    windows: Mutex<BTreeMap<u64, u32>>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limit: config.requests_per_minute,
            windows: Mutex::new(BTreeMap::new()),
        }
    }

    /// The window containing the current wall-clock time.
    pub fn current_window() -> u64 {
        unix_now() / WINDOW_SECS
    }

    /// Time until the current window rolls over.
    pub fn retry_after() -> Duration {
        Duration::from_secs(WINDOW_SECS - unix_now() % WINDOW_SECS)
    }

    /// Count one request against `window`. Returns `false` (without
    /// counting) when the window is already full.
    ///
    /// Windows older than the one before `window` are discarded.
    pub fn check_and_increment(&self, window: u64) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let oldest_kept = window.saturating_sub(1);
        windows.retain(|&w, _| w >= oldest_kept);

        let count = windows.entry(window).or_insert(0);
        if *count >= self.limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Check the current window, mapping refusal to [`RelayError::RateLimited`].
    pub fn try_acquire(&self) -> Result<()> {
        if self.check_and_increment(Self::current_window()) {
            Ok(())
        } else {
            metrics::counter!(crate::telemetry::RATE_LIMITED_TOTAL).increment(1);
            Err(RelayError::RateLimited {
                retry_after: Some(Self::retry_after()),
            })
        }
    }

    /// Requests counted so far in `window`.
    pub fn count(&self, window: u64) -> u32 {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.get(&window).copied().unwrap_or(0)
    }

    /// Windows currently tracked.
    pub fn tracked_windows(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
