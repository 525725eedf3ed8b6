//! Request-count rate limiter over a rolling time window.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::debug;

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Allows at most `limit` acquisitions per `window`.
///
/// The window opens at the first acquisition after the previous one
/// elapsed. Once `limit` is reached, callers wait until the window closes,
/// then a fresh window starts.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    /// Creates a limiter allowing `limit` requests per `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Creates a limiter allowing `requests_per_minute` requests per 60 seconds.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Takes one request slot, waiting for the window to reset if needed.
    ///
    /// Waiting callers are served one at a time.
    ///
    /// # Returns
    ///
    /// How long the caller was suspended (zero when a slot was free).
    pub async fn acquire(&self) -> Duration {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }

        let mut waited = Duration::ZERO;
        if state.count >= self.limit {
            let resets_at = state.started + self.window;
            waited = resets_at.saturating_duration_since(now);
            if !waited.is_zero() {
                debug!(wait_secs = waited.as_secs_f64(), "Rate limit reached, waiting");
                time::sleep_until(resets_at).await;
            }
            state.started = Instant::now();
            state.count = 0;
        }

        state.count += 1;
        waited
    }

    /// Requests counted in the current window.
    pub async fn used(&self) -> u32 {
        let state = self.state.lock().await;
        if state.started.elapsed() >= self.window {
            0
        } else {
            state.count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_waits_when_window_is_full() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..3 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
        assert_eq!(limiter.used().await, 3);

        let waited = limiter.acquire().await;
        assert_eq!(waited, Duration::from_secs(60));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(limiter.used().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_elapsing() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        limiter.acquire().await;
        limiter.acquire().await;

        time::advance(Duration::from_secs(11)).await;
        assert_eq!(limiter.used().await, 0);
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_wait_only_covers_remaining_window() {
        let limiter = RateLimiter::per_minute(1);
        limiter.acquire().await;

        time::advance(Duration::from_secs(45)).await;
        let waited = limiter.acquire().await;
        assert_eq!(waited, Duration::from_secs(15));
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.limit(), 1);
    }
}
