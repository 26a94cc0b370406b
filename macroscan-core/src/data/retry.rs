//! Bounded retry with exponential backoff.
//!
//! Only transient failures (network errors, rate limiting) are retried.
//! Parse failures and missing indicators are final after a single call.

use rand::Rng;
use std::time::Duration;

use super::pacing::Sleeper;
use super::provider::FetchError;

/// Retry policy for one logical fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first. `1` disables retry.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Single call, no sleeping.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Deterministic part of the delay after failed attempt `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)`, raised to a `Retry-After` hint if one was
    /// given, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        let wanted = match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        };
        wanted.min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Terminal outcome after the retry budget is spent (or a permanent error).
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub last_error: FetchError,
    pub attempts: u32,
}

/// Call `f` until it succeeds, fails permanently, or attempts run out.
pub fn call_with_retry<T, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut f: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Result<T, FetchError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() || attempt >= max_attempts => {
                return Err(RetryFailure {
                    last_error: err,
                    attempts: attempt,
                });
            }
            Err(err) => {
                let hint = err.retry_after_secs().map(Duration::from_secs);
                let delay = policy.backoff_delay(attempt, hint) + policy.jitter();
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                sleeper.sleep(delay);
                attempt += 1;
            }
        }
    }
}
