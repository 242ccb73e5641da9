use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::WINDOW_SIZE;

/// Sliding-window ledger of token usage, safe for concurrent tasks.
///
/// Entries older than the window are pruned on every mutation and read, so
/// the ledger never grows beyond one window of traffic.
pub struct TokenTracker {
    window_size: Duration,
    usage_history: Mutex<VecDeque<(Instant, u32)>>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::with_window(WINDOW_SIZE)
    }

    pub fn with_window(window_size: Duration) -> Self {
        Self {
            window_size,
            usage_history: Mutex::new(VecDeque::new()),
        }
    }

    /// Record `tokens` consumed now, then drop entries that fell out of the
    /// window. Append and prune happen under one lock so readers never see a
    /// half-pruned ledger.
    pub async fn add_usage(&self, tokens: u32) {
        let mut history = self.usage_history.lock().await;
        let now = Instant::now();
        history.push_back((now, tokens));
        Self::prune(&mut history, now, self.window_size);
    }

    /// Total tokens consumed inside the trailing window.
    pub async fn usage_in_window(&self) -> u32 {
        let mut history = self.usage_history.lock().await;
        Self::prune(&mut history, Instant::now(), self.window_size);
        history.iter().map(|(_, tokens)| tokens).sum()
    }

    fn prune(history: &mut VecDeque<(Instant, u32)>, now: Instant, window: Duration) {
        while let Some((time, _)) = history.front() {
            if now.duration_since(*time) >= window {
                history.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self::new()
    }
}
