// =============================================================================
// Per-second sliding-window rate limiters (public / private buckets)
// =============================================================================
//
// Each bucket keeps a queue of recent request timestamps. `take()` drops
// entries older than the window, and if the bucket is full it sleeps until the
// oldest entry ages out. Concurrent callers are serialized under the bucket's
// lock, so over any sliding window the dispatched count never exceeds the cap.
//
// The clock is injected so tests can drive synthetic time.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

/// Monotonic time + sleep seam.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    async fn sleep_ms(&self, ms: u64);
}

/// Production clock: milliseconds since construction, `tokio::time::sleep`.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

/// One rate-limit bucket: at most `cap` requests per sliding `window_ms`.
pub struct SlidingWindowLimiter {
    name: &'static str,
    cap: usize,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    recent: tokio::sync::Mutex<VecDeque<u64>>,
}

impl SlidingWindowLimiter {
    pub fn new(name: &'static str, cap: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            cap: cap.max(1),
            window_ms: 1000,
            clock,
            recent: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Acquire one request slot, sleeping as long as the sliding window is
    /// saturated. The bucket lock is held across the sleep, which serializes
    /// concurrent callers.
    pub async fn take(&self) {
        let mut recent = self.recent.lock().await;
        loop {
            let now = self.clock.now_ms();
            while recent
                .front()
                .is_some_and(|&t| t + self.window_ms <= now)
            {
                recent.pop_front();
            }
            if recent.len() < self.cap {
                recent.push_back(now);
                return;
            }
            // Queue is full and every entry is still inside the window, so the
            // front exists and expires in the future.
            let oldest = *recent.front().unwrap_or(&now);
            let wait = (oldest + self.window_ms).saturating_sub(now).max(1);
            debug!(bucket = self.name, wait_ms = wait, "rate limit saturated");
            self.clock.sleep_ms(wait).await;
        }
    }
}

/// The client's two buckets: public market data vs private (signed) calls.
pub struct RateLimits {
    pub public: SlidingWindowLimiter,
    pub private: SlidingWindowLimiter,
}

impl RateLimits {
    pub fn new(public_cap: usize, private_cap: usize) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        Self {
            public: SlidingWindowLimiter::new("public", public_cap, clock.clone()),
            private: SlidingWindowLimiter::new("private", private_cap, clock),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Synthetic clock: `sleep_ms` advances time instantly and records the
    /// requested durations.
    struct TestClock {
        now: AtomicU64,
        sleeps: Mutex<Vec<u64>>,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                now: AtomicU64::new(0),
                sleeps: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        async fn sleep_ms(&self, ms: u64) {
            self.sleeps.lock().push(ms);
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn five_takes_at_cap_two_serialize_in_one_second_steps() {
        let clock = Arc::new(TestClock::new());
        let limiter = SlidingWindowLimiter::new("test", 2, clock.clone());

        for _ in 0..5 {
            limiter.take().await;
        }

        assert_eq!(*clock.sleeps.lock(), vec![1000, 1000]);
        assert_eq!(clock.now_ms(), 2000);
    }

    #[tokio::test]
    async fn under_cap_never_sleeps() {
        let clock = Arc::new(TestClock::new());
        let limiter = SlidingWindowLimiter::new("test", 10, clock.clone());

        for _ in 0..10 {
            limiter.take().await;
        }

        assert!(clock.sleeps.lock().is_empty());
        assert_eq!(clock.now_ms(), 0);
    }

    #[tokio::test]
    async fn entries_age_out_after_window() {
        let clock = Arc::new(TestClock::new());
        let limiter = SlidingWindowLimiter::new("test", 1, clock.clone());

        limiter.take().await;
        // Second take saturates and must wait the full window.
        limiter.take().await;
        assert_eq!(*clock.sleeps.lock(), vec![1000]);

        // Advance past the window: next take is free.
        clock.now.fetch_add(1500, Ordering::SeqCst);
        limiter.take().await;
        assert_eq!(clock.sleeps.lock().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_respect_cap() {
        let clock = Arc::new(TestClock::new());
        let limiter = Arc::new(SlidingWindowLimiter::new("test", 2, clock.clone()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.take().await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // 6 takes at cap 2: two full windows of waiting regardless of caller
        // interleaving.
        assert_eq!(clock.now_ms(), 2000);
    }
}
