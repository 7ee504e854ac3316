//! Retry policy evaluation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ActivityError;

/// Retry configuration attached to an activity invocation.
///
/// Defaults match the order workflow's options: 3 attempts, 2s initial
/// interval, coefficient 2.0, capped at 100x the initial interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. Values below 1 act as 1.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let initial_interval = Duration::from_secs(2);
        Self {
            max_attempts: 3,
            initial_interval,
            backoff_coefficient: 2.0,
            max_interval: initial_interval * 100,
        }
    }
}

/// Outcome of evaluating a failed attempt against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule attempt `attempt + 1` after the delay.
    RetryAfter(Duration),
    /// No further attempts; the failure is terminal for the step.
    Exhausted,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay between attempt `attempt` and `attempt + 1`:
    /// `min(initial_interval * coefficient^(attempt - 1), max_interval)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self
            .backoff_coefficient
            .powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let secs = self.initial_interval.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Decides what happens after `attempt` (1-based) failed with `error`.
    pub fn evaluate(&self, attempt: u32, error: &ActivityError) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.effective_max_attempts() {
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAfter(self.delay_after(attempt))
    }
}
