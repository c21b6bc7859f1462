//! # Adaptive poll scheduling
//!
//! A small hysteresis state machine. Consecutive failures lengthen the poll
//! interval by `factor`, consecutive successes shorten it again, and a single
//! blip in either direction only resets the opposing streak. Reaching a
//! threshold applies the adjustment and clears both streaks.
//!
//! Everything here is pure; the sync loop owns the timer.

use std::time::Duration;

/// Immutable scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial_interval: Duration,
    max_interval: Duration,
    factor: u32,
    success_threshold: u32,
    error_threshold: u32,
}

impl BackoffPolicy {
    /// Build a policy. `factor` and both thresholds are raised to at least 1
    /// and `initial_interval` is lowered to `max_interval` if it exceeds it.
    pub fn new(
        initial_interval: Duration,
        max_interval: Duration,
        factor: u32,
        success_threshold: u32,
        error_threshold: u32,
    ) -> Self {
        Self {
            initial_interval: initial_interval.min(max_interval),
            max_interval,
            factor: factor.max(1),
            success_threshold: success_threshold.max(1),
            error_threshold: error_threshold.max(1),
        }
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    pub fn error_threshold(&self) -> u32 {
        self.error_threshold
    }

    /// State at loop start: initial interval, no streaks.
    pub fn initial_state(&self) -> BackoffState {
        BackoffState { interval: self.initial_interval, success_streak: 0, error_streak: 0 }
    }

    fn shrink(&self, interval: Duration) -> Duration {
        (interval / self.factor).max(self.initial_interval)
    }

    fn expand(&self, interval: Duration) -> Duration {
        interval.checked_mul(self.factor).unwrap_or(Duration::MAX).min(self.max_interval)
    }
}

/// Mutable scheduling state, advanced once per fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    interval: Duration,
    success_streak: u32,
    error_streak: u32,
}

impl BackoffState {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn success_streak(&self) -> u32 {
        self.success_streak
    }

    pub fn error_streak(&self) -> u32 {
        self.error_streak
    }

    /// Feed one attempt outcome and return the interval to wait before the
    /// next attempt together with the new state.
    pub fn next(self, policy: &BackoffPolicy, success: bool) -> (Duration, BackoffState) {
        let next = if success {
            let streak = self.success_streak.saturating_add(1);
            if streak >= policy.success_threshold {
                BackoffState {
                    interval: policy.shrink(self.interval),
                    success_streak: 0,
                    error_streak: 0,
                }
            } else {
                BackoffState { interval: self.interval, success_streak: streak, error_streak: 0 }
            }
        } else {
            let streak = self.error_streak.saturating_add(1);
            if streak >= policy.error_threshold {
                BackoffState {
                    interval: policy.expand(self.interval),
                    success_streak: 0,
                    error_streak: 0,
                }
            } else {
                BackoffState { interval: self.interval, success_streak: 0, error_streak: streak }
            }
        };

        (next.interval, next)
    }
}
