use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Instant};

use crate::config::{RateLimitConfig, SAFETY_MARGIN, WINDOW_SIZE};
use crate::error::{Error, Result};
use crate::tracker::TokenTracker;

/// Proof of admission through the rate limiter.
///
/// Holds the concurrency slot. The slot is returned when the permit is
/// passed back through [`RateLimiter::release`], or on drop if the holder is
/// cancelled mid-call, so a slot can never leak on any exit path.
pub struct RequestPermit {
    _permit: OwnedSemaphorePermit,
}

/// Read-only counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub in_flight: u32,
    pub requests_in_window: u32,
    pub tokens_in_window: u32,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub max_concurrent_requests: u32,
    pub burst_limit: u32,
}

/// Gates every outbound provider call through three constraints: a
/// concurrency semaphore, a requests-per-minute sliding window, and a
/// tokens-per-minute ledger. Violations block the caller; nothing is
/// rejected.
pub struct RateLimiter {
    config: RateLimitConfig,
    tracker: Arc<TokenTracker>,
    semaphore: Arc<Semaphore>,
    request_times: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// # Panics
    ///
    /// Panics if any ceiling in `config` is zero.
    pub fn new(config: RateLimitConfig) -> Self {
        assert!(config.requests_per_minute > 0, "requests_per_minute must be positive");
        assert!(config.tokens_per_minute > 0, "tokens_per_minute must be positive");
        assert!(
            config.max_concurrent_requests > 0,
            "max_concurrent_requests must be positive"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests as usize));
        Self {
            config,
            tracker: Arc::new(TokenTracker::new()),
            semaphore,
            request_times: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Acquire permission for one outbound call. Suspends until a
    /// concurrency slot is free, then until both the request window and the
    /// token budget admit the call. Unbounded: callers needing a deadline
    /// wrap this in a timeout externally.
    pub async fn acquire(&self, estimated_tokens: u32) -> Result<RequestPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Limiter(e.to_string()))?;

        // The slot is held across both admission waits; if the caller is
        // cancelled here the permit's drop returns it.
        self.wait_for_request_slot().await;
        self.wait_for_token_budget(estimated_tokens).await;

        self.request_times.lock().await.push_back(Instant::now());

        Ok(RequestPermit { _permit: permit })
    }

    /// Release the slot and record what the call actually cost. The ledger
    /// write is fire-and-forget so release itself never suspends.
    pub fn release(&self, permit: RequestPermit, actual_tokens: u32) {
        drop(permit);

        if actual_tokens > 0 {
            let tracker = Arc::clone(&self.tracker);
            tokio::spawn(async move {
                tracker.add_usage(actual_tokens).await;
            });
        }
    }

    /// Block until the requests-per-minute window has room. Sleeps happen
    /// outside the lock; a zero wait yields once instead of spinning.
    async fn wait_for_request_slot(&self) {
        loop {
            let wait = {
                let mut times = self.request_times.lock().await;
                let now = Instant::now();
                Self::prune(&mut times, now);

                if (times.len() as u32) < self.config.requests_per_minute {
                    return;
                }

                match times.front() {
                    Some(oldest) => {
                        (WINDOW_SIZE + SAFETY_MARGIN).saturating_sub(now.duration_since(*oldest))
                    }
                    None => return,
                }
            };

            if wait.is_zero() {
                // Raced the window boundary; let other tasks make progress
                // and re-check.
                tokio::task::yield_now().await;
            } else {
                // Small jitter keeps simultaneously woken waiters from
                // stampeding the lock.
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(2..8));
                warn!(
                    "request window full, sleeping {:.3}s",
                    (wait + jitter).as_secs_f64()
                );
                sleep(wait + jitter).await;
            }
        }
    }

    /// Block until the token budget admits `estimated_tokens`. Waits out a
    /// full window on breach rather than computing the precise remainder.
    async fn wait_for_token_budget(&self, estimated_tokens: u32) {
        loop {
            let current = self.tracker.usage_in_window().await;
            if current + estimated_tokens > self.config.tokens_per_minute {
                warn!(
                    "token budget reached: {} used, {} requested, sleeping {}s",
                    current,
                    estimated_tokens,
                    WINDOW_SIZE.as_secs()
                );
                sleep(WINDOW_SIZE).await;
            } else {
                return;
            }
        }
    }

    pub async fn status(&self) -> LimiterStatus {
        let requests_in_window = {
            let mut times = self.request_times.lock().await;
            Self::prune(&mut times, Instant::now());
            times.len() as u32
        };

        LimiterStatus {
            in_flight: self.config.max_concurrent_requests
                - self.semaphore.available_permits() as u32,
            requests_in_window,
            tokens_in_window: self.tracker.usage_in_window().await,
            requests_per_minute: self.config.requests_per_minute,
            tokens_per_minute: self.config.tokens_per_minute,
            max_concurrent_requests: self.config.max_concurrent_requests,
            burst_limit: self.config.burst_limit,
        }
    }

    fn prune(times: &mut VecDeque<Instant>, now: Instant) {
        while let Some(time) = times.front() {
            if now.duration_since(*time) >= WINDOW_SIZE {
                times.pop_front();
            } else {
                break;
            }
        }
    }
}
