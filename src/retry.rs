//! Bounded read-modify-write retry with exponential backoff.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::engine::EngineError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `attempt` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    ///
    /// `attempt` must redo the whole read-validate-commit cycle each call.
    pub async fn run<T, F>(&self, op: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Result<T, EngineError>,
    {
        for n in 1..=self.max_attempts {
            match attempt() {
                Err(e) if e.is_transient() => {
                    debug!(op, attempt = n, reason = %e, "commit conflict, retrying");
                    if n < self.max_attempts {
                        tokio::time::sleep(self.backoff(n)).await;
                    }
                }
                result => return result,
            }
        }
        warn!(op, attempts = self.max_attempts, "retry budget exhausted");
        Err(EngineError::ConcurrencyExhausted {
            op,
            attempts: self.max_attempts,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let delay = exp.min(self.max_backoff);
        let jitter_ms = delay.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}
