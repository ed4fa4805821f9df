//! Client-side request quota enforcement.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window rate limiter.
///
/// On each acquire, timestamps older than the window are dropped; if the
/// remaining count is at the cap, the caller sleeps until the oldest
/// timestamp ages out. The mutex guard is held across that sleep, so queued
/// callers drain strictly in arrival order.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a request slot is available, then claim it.
    pub async fn acquire(&self) {
        let mut timestamps = self.timestamps.lock().await;
        loop {
            let now = Instant::now();
            while timestamps
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                timestamps.pop_front();
            }

            if timestamps.len() < self.max_requests {
                timestamps.push_back(now);
                return;
            }

            let Some(oldest) = timestamps.front().copied() else {
                continue;
            };
            tracing::debug!(
                target: "client",
                in_window = timestamps.len(),
                "Rate limit reached, waiting for window to roll"
            );
            tokio::time::sleep_until(oldest + self.window).await;
        }
    }

    /// Requests currently counted inside the window.
    pub async fn in_window(&self) -> usize {
        let mut timestamps = self.timestamps.lock().await;
        let now = Instant::now();
        while timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            timestamps.pop_front();
        }
        timestamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn allows_burst_up_to_cap() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_window().await, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn eleventh_request_waits_for_oldest_to_age_out() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_rather_than_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.acquire().await;

        // The first slot frees 30s from now, the second 60s from now.
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(30));

        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }
}
