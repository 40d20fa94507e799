//! Token-bucket admission control for exchange calls, with adaptive
//! back-off driven by 429 responses.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub tokens_per_second: f64,
    pub capacity: f64,
    pub initial: Option<f64>,
    pub min_rate: f64,
    pub max_rate: f64,
    pub backoff_factor: f64,
    pub recovery_factor: f64,
    pub recovery_threshold: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 8.0,
            capacity: 15.0,
            initial: None,
            min_rate: 2.0,
            max_rate: 12.0,
            backoff_factor: 0.5,
            recovery_factor: 1.1,
            recovery_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_waits: u64,
    pub total_wait_ms: f64,
    pub current_tokens: f64,
    pub current_rate: f64,
}

impl RateLimiterStats {
    pub fn avg_wait_ms(&self) -> f64 {
        if self.total_waits == 0 {
            0.0
        } else {
            self.total_wait_ms / self.total_waits as f64
        }
    }
}

struct Bucket {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
    consecutive_successes: u32,
    total_requests: u64,
    total_waits: u64,
    total_wait_ms: f64,
}

impl Bucket {
    fn refill(&mut self, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(capacity);
        self.last_refill = now;
    }
}

/// All state lives under one async mutex; `acquire` sleeps for exactly the
/// token deficit while holding it, so waiters drain in FIFO order.
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    inner: Mutex<Bucket>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let tokens = config.initial.unwrap_or(config.capacity);
        let rate = config.tokens_per_second;
        Self {
            config,
            inner: Mutex::new(Bucket {
                tokens,
                rate,
                last_refill: Instant::now(),
                consecutive_successes: 0,
                total_requests: 0,
                total_waits: 0,
                total_wait_ms: 0.0,
            }),
        }
    }

    /// Acquires `n` tokens, sleeping for the deficit when the bucket is dry.
    /// Returns the time spent waiting.
    pub async fn acquire(&self, n: f64) -> Duration {
        let mut bucket = self.inner.lock().await;
        bucket.refill(self.config.capacity);

        let mut waited = Duration::ZERO;
        if bucket.tokens < n {
            let deficit = n - bucket.tokens;
            waited = Duration::from_secs_f64(deficit / bucket.rate);
            tokio::time::sleep(waited).await;
            bucket.refill(self.config.capacity);
            bucket.total_waits += 1;
            bucket.total_wait_ms += waited.as_secs_f64() * 1000.0;
        }

        bucket.tokens = (bucket.tokens - n).max(0.0);
        bucket.total_requests += 1;
        waited
    }

    /// Consumes `n` tokens only if immediately available.
    pub async fn try_acquire(&self, n: f64) -> bool {
        let mut bucket = self.inner.lock().await;
        bucket.refill(self.config.capacity);
        if bucket.tokens >= n {
            bucket.tokens -= n;
            bucket.total_requests += 1;
            true
        } else {
            false
        }
    }

    /// 429 from the exchange: halve the rate (clamped at `min_rate`).
    pub async fn on_rate_limited(&self) {
        let mut bucket = self.inner.lock().await;
        bucket.rate = (bucket.rate * self.config.backoff_factor).max(self.config.min_rate);
        bucket.consecutive_successes = 0;
        log::warn!("rate_limiter.backoff rate={:.2}/s", bucket.rate);
    }

    /// Successful call; after `recovery_threshold` in a row, nudge the rate
    /// back up (clamped at `max_rate`).
    pub async fn on_success(&self) {
        let mut bucket = self.inner.lock().await;
        bucket.consecutive_successes += 1;
        if bucket.consecutive_successes >= self.config.recovery_threshold {
            let old = bucket.rate;
            bucket.rate = (bucket.rate * self.config.recovery_factor).min(self.config.max_rate);
            bucket.consecutive_successes = 0;
            if bucket.rate > old {
                log::info!("rate_limiter.recovery rate={:.2}/s", bucket.rate);
            }
        }
    }

    pub async fn current_rate(&self) -> f64 {
        self.inner.lock().await.rate
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let mut bucket = self.inner.lock().await;
        bucket.refill(self.config.capacity);
        RateLimiterStats {
            total_requests: bucket.total_requests,
            total_waits: bucket.total_waits,
            total_wait_ms: bucket.total_wait_ms,
            current_tokens: bucket.tokens,
            current_rate: bucket.rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, capacity: f64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimiterConfig {
            tokens_per_second: rate,
            capacity,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_capacity_does_not_wait() {
        let l = limiter(10.0, 5.0);
        for _ in 0..5 {
            assert_eq!(l.acquire(1.0).await, Duration::ZERO);
        }
        let stats = l.stats().await;
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.total_waits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_deficit() {
        let l = limiter(10.0, 2.0);
        l.acquire(2.0).await;
        // Bucket is empty; one more token needs 100ms at 10/s.
        let waited = l.acquire(1.0).await;
        assert!(waited >= Duration::from_millis(99), "waited {waited:?}");
        let stats = l.stats().await;
        assert_eq!(stats.total_waits, 1);
        assert!(stats.avg_wait_ms() >= 99.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let l = limiter(10.0, 5.0);
        l.acquire(5.0).await;
        assert!(!l.try_acquire(1.0).await);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(l.try_acquire(4.0).await);
    }

    #[tokio::test]
    async fn rate_limited_backs_off_and_recovers() {
        let l = AdaptiveRateLimiter::new(RateLimiterConfig {
            tokens_per_second: 8.0,
            min_rate: 2.0,
            max_rate: 12.0,
            backoff_factor: 0.5,
            recovery_factor: 1.1,
            recovery_threshold: 3,
            ..Default::default()
        });

        l.on_rate_limited().await;
        assert_eq!(l.current_rate().await, 4.0);
        l.on_rate_limited().await;
        assert_eq!(l.current_rate().await, 2.0);
        l.on_rate_limited().await;
        assert_eq!(l.current_rate().await, 2.0); // clamped at min

        for _ in 0..3 {
            l.on_success().await;
        }
        assert!((l.current_rate().await - 2.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rate_limited_resets_recovery_streak() {
        let l = AdaptiveRateLimiter::new(RateLimiterConfig {
            recovery_threshold: 3,
            ..Default::default()
        });
        l.on_success().await;
        l.on_success().await;
        l.on_rate_limited().await;
        let rate_after_backoff = l.current_rate().await;
        // Two more successes must not trigger recovery yet.
        l.on_success().await;
        l.on_success().await;
        assert_eq!(l.current_rate().await, rate_after_backoff);
    }
}
