//! Token-bucket arithmetic, independent of any clock or lock.

use std::time::Duration;

use tokio::time::Instant;

/// Token bucket refilled continuously at `max_tokens` per minute.
///
/// Callers that find the bucket empty get a *reservation*: the token they will
/// own once the returned wait has elapsed. `last_refill` then points into the
/// future, so later callers queue up behind the outstanding reservations.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket sized for `requests_per_minute`.
    pub fn new(requests_per_minute: u32, now: Instant) -> Self {
        let max_tokens = f64::from(requests_per_minute.max(1));
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_per_sec: max_tokens / 60.0,
            last_refill: now,
        }
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    /// Tokens available at `now`, without consuming anything.
    pub fn available(&self, now: Instant) -> f64 {
        let mut view = self.clone();
        view.refill(now);
        view.tokens
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Consume one token, returning how long the caller has to wait before
    /// using it (zero when a token was already available).
    pub fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Duration::ZERO;
        }

        let queued = self.last_refill.saturating_duration_since(now);
        let deficit = Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec);
        let wait = queued + deficit;

        self.tokens = 0.0;
        self.last_refill = now + wait;
        wait
    }
}
