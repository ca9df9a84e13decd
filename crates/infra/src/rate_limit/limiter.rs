use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use super::bucket::TokenBucket;

/// Snapshot of a limiter's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub tokens_available: f64,
    pub max_tokens: f64,
    pub requests_per_minute: u32,
}

/// Token-bucket limiter for one external API.
///
/// The bucket mutex is only held to compute the reservation; the wait itself
/// happens after the mutex is released.
#[derive(Debug)]
pub struct RateLimiter {
    api: String,
    requests_per_minute: u32,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(api: impl Into<String>, requests_per_minute: u32) -> Self {
        Self {
            api: api.into(),
            requests_per_minute,
            bucket: Mutex::new(TokenBucket::new(requests_per_minute, Instant::now())),
        }
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Wait until a request may be sent. Returns how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let wait = self
            .bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve(Instant::now());

        if wait.is_zero() {
            debug!(api = %self.api, "rate limiter token granted");
            return wait;
        }

        info!(
            api = %self.api,
            wait_ms = wait.as_millis() as u64,
            "rate limit reached, waiting before next request"
        );
        tokio::time::sleep(wait).await;
        wait
    }

    pub fn stats(&self) -> RateLimiterStats {
        let bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        RateLimiterStats {
            tokens_available: bucket.available(Instant::now()),
            max_tokens: bucket.max_tokens(),
            requests_per_minute: self.requests_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_of_max_tokens_does_not_block() {
        let limiter = RateLimiter::new("nvd_api", 5);
        let start = Instant::now();

        for _ in 0..5 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn request_past_the_burst_waits_sixty_over_n() {
        let limiter = RateLimiter::new("nvd_api", 5);
        for _ in 0..5 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        let waited = limiter.acquire().await;

        assert_eq!(waited, Duration::from_secs(12));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(12));
        assert!(elapsed < Duration::from_millis(12_100));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_are_spaced_out() {
        let limiter = Arc::new(RateLimiter::new("github_api", 60));
        for _ in 0..60 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        let a = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await }
        });
        let b = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await }
        });

        let mut waits = vec![a.await.unwrap(), b.await.unwrap()];
        waits.sort();
        assert_eq!(waits, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_consumption_and_refill() {
        let limiter = RateLimiter::new("ollama", 60);
        limiter.acquire().await;
        limiter.acquire().await;

        let stats = limiter.stats();
        assert_eq!(stats.max_tokens, 60.0);
        assert_eq!(stats.requests_per_minute, 60);
        assert!((stats.tokens_available - 58.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((limiter.stats().tokens_available - 59.0).abs() < 1e-6);
    }
}
