//! Keyed sliding-window rate limiter.
//!
//! Each key keeps the timestamps of its admitted requests inside the trailing window. A key is
//! admitted while fewer than `max_requests` timestamps survive; once full, the caller learns when
//! the oldest timestamp expires. Keys whose windows empty out are dropped, and a background sweep
//! evicts idle keys independently of request volume. State lives in memory only.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

/// Default cadence for the idle-key sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests still available to the key inside the current window.
    pub remaining: usize,
    /// Instant at which the oldest admitted request leaves the window.
    pub reset_at: Instant,
}

/// Sliding-window limiter keyed by caller (client IP, upstream host, ...).
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `max_requests` per `window` for every key.
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted per key per window.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Checks `key` against its window, recording the request when admitted.
    pub async fn allow(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let history = windows.entry(key.to_string()).or_default();
        Self::purge(history, now, self.window);

        let decision = if history.len() >= self.max_requests {
            Decision {
                allowed: false,
                remaining: 0,
                reset_at: history
                    .front()
                    .map_or(now + self.window, |oldest| *oldest + self.window),
            }
        } else {
            history.push_back(now);
            Decision {
                allowed: true,
                remaining: self.max_requests - history.len(),
                reset_at: history.front().map_or(now, |oldest| *oldest + self.window),
            }
        };

        if history.is_empty() {
            windows.remove(key);
        }
        decision
    }

    /// Waits until `key` is admitted, then records the request.
    pub async fn acquire(&self, key: &str) {
        loop {
            let decision = self.allow(key).await;
            if decision.allowed {
                return;
            }
            tracing::debug!(key, "rate limit reached, waiting for window to reset");
            // Wait outside the lock.
            sleep_until(decision.reset_at + Duration::from_millis(1)).await;
        }
    }

    /// Drops every key whose window no longer holds a timestamp. Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, history| {
            Self::purge(history, now, self.window);
            !history.is_empty()
        });
        before - windows.len()
    }

    /// Number of keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }

    /// Starts a background task that sweeps every `every`. The task holds only a weak
    /// reference and exits once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let evicted = limiter.sweep().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "rate limiter swept idle keys");
                }
            }
        })
    }

    fn purge(history: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        let cutoff = now.checked_sub(window);
        while let Some(ts) = history.front() {
            match cutoff {
                Some(cutoff) if *ts <= cutoff => {
                    history.pop_front();
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn denies_only_the_request_over_the_limit() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 3);
        for expected_remaining in [2, 1, 0] {
            let decision = limiter.allow("10.0.0.1").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = limiter.allow("10.0.0.1").await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, Instant::now() + Duration::from_secs(10));

        advance(Duration::from_secs(10)).await;
        assert!(limiter.allow("10.0.0.1").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 1);
        assert!(limiter.allow("a").await.allowed);
        assert!(!limiter.allow("a").await.allowed);
        assert!(limiter.allow("b").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_per_timestamp() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 2);
        assert!(limiter.allow("k").await.allowed);
        advance(Duration::from_secs(6)).await;
        assert!(limiter.allow("k").await.allowed);
        assert!(!limiter.allow("k").await.allowed);

        // Only the first timestamp has expired.
        advance(Duration::from_secs(5)).await;
        assert!(limiter.allow("k").await.allowed);
        assert!(!limiter.allow("k").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_keys() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 5);
        limiter.allow("a").await;
        limiter.allow("b").await;
        assert_eq!(limiter.tracked_keys().await, 2);

        advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.sweep().await, 2);
        assert_eq!(limiter.tracked_keys().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_capacity_never_admits_or_retains() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 0);
        assert!(!limiter.allow("a").await.allowed);
        assert_eq!(limiter.tracked_keys().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_reset() {
        let limiter = RateLimiter::new(Duration::from_secs(5), 1);
        let start = Instant::now();
        limiter.acquire("host").await;
        limiter.acquire("host").await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_runs_and_stops() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1), 5));
        let sweeper = limiter.spawn_sweeper(Duration::from_secs(60));
        limiter.allow("idle").await;

        advance(Duration::from_secs(61)).await;
        for _ in 0..10 {
            if limiter.tracked_keys().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.tracked_keys().await, 0);

        drop(limiter);
        advance(Duration::from_secs(61)).await;
        sweeper.await.expect("sweeper exits once limiter is dropped");
    }
}
