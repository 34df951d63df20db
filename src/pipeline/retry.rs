//! Retry-with-backoff policy for model calls.
//!
//! [`RetryPolicy`] is plain data plus pure functions: given the retry number
//! and the error, it answers "wait this long and try again" or "give up".
//! The network call itself is supplied by the caller, so the schedule is
//! unit-testable without any I/O.
//!
//! With the defaults (3 retries, 500 ms, ×2) the waits are 500 ms → 1 s → 2 s.
//! A `Retry-After` hint from a 429 response replaces the computed delay,
//! still bounded by `max_backoff`.

use crate::error::ModelError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), ignoring the budget.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let factor = self.multiplier.max(1).saturating_pow(exp);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Every delay the policy would wait through, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|r| self.backoff(r)).collect()
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed with `error`.
    ///
    /// Returns the delay before the next attempt, or `None` to give up.
    pub fn next_delay(&self, attempt: u32, error: &ModelError) -> Option<Duration> {
        if !error.is_transient() || attempt > self.max_retries {
            return None;
        }
        let computed = self.backoff(attempt);
        match error {
            ModelError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs).min(self.max_backoff).max(computed)),
            _ => Some(computed),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Returns the final result
    /// together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> (Result<T, ModelError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return (Ok(v), attempt),
                Err(e) => match self.next_delay(attempt, &e) {
                    Some(delay) => {
                        warn!(
                            "{}: attempt {}/{} failed ({}); retrying in {}ms",
                            label,
                            attempt,
                            self.max_retries + 1,
                            e,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return (Err(e), attempt),
                },
            }
        }
    }
}
