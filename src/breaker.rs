//! Circuit breaker gating connection attempts.
//!
//! Tracks a saturating failure count and the wall-clock time of the last
//! failure. [`CircuitBreaker::state`] is a pure function of those fields
//! and the supplied time, so the breaker itself never reads the clock; the
//! caller passes milliseconds from [`now_ms`].

use std::time::Duration;

use crate::constants::{BACKOFF_BASE_MS, BACKOFF_CAP_MS};

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Observable breaker state at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Failures are under the threshold; attempts flow.
    Closed,
    /// The cooldown has elapsed; one probe attempt is allowed.
    HalfOpen,
    /// Too many recent failures; attempts fail fast.
    Open,
}

/// Failure tracker with exponential pre-connect backoff.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    fails: u64,
    last_failed_ms: i64,
    max_fails: u64,
    reset_ms: i64,
}

impl CircuitBreaker {
    /// Breaker starting closed. `max_fails` and `reset` must be non-zero.
    pub fn closed(max_fails: u64, reset: Duration) -> Self {
        assert!(max_fails > 0, "max_fails must be non-zero");
        let reset_ms = reset.as_millis() as i64;
        assert!(reset_ms > 0, "reset must be non-zero");
        Self {
            fails: 0,
            last_failed_ms: 0,
            max_fails,
            reset_ms,
        }
    }

    /// Breaker starting half-open: the next attempt is the probe.
    pub fn half_open(max_fails: u64, reset: Duration) -> Self {
        Self {
            fails: u64::MAX,
            last_failed_ms: 0,
            ..Self::closed(max_fails, reset)
        }
    }

    /// Breaker starting open: attempts fail fast until a success resets it.
    pub fn open(max_fails: u64, reset: Duration) -> Self {
        Self {
            fails: u64::MAX,
            last_failed_ms: i64::MAX,
            ..Self::closed(max_fails, reset)
        }
    }

    /// Clear both counters after a successful attempt.
    pub fn report_success(&mut self) {
        self.fails = 0;
        self.last_failed_ms = 0;
    }

    /// Record a failed attempt at `now_ms`. The failure count saturates
    /// and the last-failure time never moves backwards.
    pub fn report_failure(&mut self, now_ms: i64) {
        self.fails = self.fails.saturating_add(1);
        self.last_failed_ms = self.last_failed_ms.max(now_ms);
    }

    /// State at time `now_ms`.
    pub fn state(&self, now_ms: i64) -> BreakerState {
        if self.fails <= self.max_fails {
            BreakerState::Closed
        } else if now_ms.saturating_sub(self.last_failed_ms) > self.reset_ms {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Whether any failure has been recorded since the last success.
    pub fn has_failures(&self) -> bool {
        self.fails > 0 && self.last_failed_ms > 0
    }

    /// Number of failures recorded since the last success.
    pub fn fails(&self) -> u64 {
        self.fails
    }

    /// Pre-connect delay for the current failure count:
    /// `min(3000 ms, 10 ms * 2^(fails - 1))`. `None` without failures.
    pub fn backoff(&self) -> Option<Duration> {
        if !self.has_failures() {
            return None;
        }
        // The schedule hits the cap at 10 failures; clamp the exponent so
        // the shift cannot overflow for saturated counts.
        let exp = (self.fails - 1).min(20) as u32;
        let ms = (BACKOFF_BASE_MS << exp).min(BACKOFF_CAP_MS);
        Some(Duration::from_millis(ms))
    }
}
