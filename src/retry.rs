use std::future::Future;
use std::time::Duration;

use log::{error, warn};
use rand::Rng;
use tokio::time::sleep;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

/// Bounded-retry policy with jittered exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_secs_f64(config.base_backoff),
        }
    }

    /// `base * 2^attempt` plus up to one second of uniform jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_backoff.as_secs_f64() * f64::from(1u32 << attempt.min(16));
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(exponential + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

/// Run one logical outbound call, retrying transient failures.
///
/// `operation` is invoked fresh for every attempt (initial try plus up to
/// `max_retries` retries). Errors that classify as non-retryable, and the
/// last error once attempts are exhausted, surface to the caller unchanged.
pub async fn execute_with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= policy.max_retries {
                    error!(
                        "request failed after {} retries: {}",
                        policy.max_retries, e
                    );
                    return Err(e);
                }

                let delay = policy.backoff_delay(attempt);
                warn!(
                    "request failed (attempt {}), retrying in {:.2}s: {}",
                    attempt + 1,
                    delay.as_secs_f64(),
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
