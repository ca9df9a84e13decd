//! Retry configuration and the reusable retry wrapper.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one (>= 1).
    pub max_retries: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Cap applied before jitter.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Preset for transient network failures: three quick attempts.
    pub fn network() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay after a failure of attempt `attempt` (1-indexed):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_backoff.as_secs_f64();

        if !raw.is_finite() || raw >= max {
            self.max_backoff
        } else {
            Duration::from_secs_f64(raw.max(0.0))
        }
    }

    /// Scale an already-clamped delay by `factor` when jitter is enabled.
    ///
    /// Saturates at `Duration::MAX` for uncapped policies.
    pub fn apply_jitter(&self, backoff: Duration, factor: f64) -> Duration {
        if self.jitter {
            Duration::try_from_secs_f64(backoff.as_secs_f64() * factor.max(0.0))
                .unwrap_or(Duration::MAX)
        } else {
            backoff
        }
    }

    /// Delay to sleep after attempt `attempt` failed.
    pub fn delay_after_failure(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let backoff = self.backoff_for_attempt(attempt);
        if self.jitter {
            self.apply_jitter(backoff, rng.random_range(0.5..1.5))
        } else {
            backoff
        }
    }
}

/// Terminal outcome of a retried operation. Always carries the last error.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retries exhausted after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },
    #[error("non-retryable failure on attempt {attempt}: {error}")]
    NonRetryable { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::NonRetryable { attempt, .. } => *attempt,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => error,
        }
    }
}

/// Attempt bookkeeping shared by the wrapper and [`super::RetryableOperation`].
#[derive(Debug, Default, Clone)]
pub(crate) struct AttemptTracker {
    pub(crate) attempts: u32,
    pub(crate) last_error: Option<String>,
}

/// Reusable retry wrapper: configure once, apply to any number of calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self::named("operation", config)
    }

    /// A policy whose log lines carry `name`.
    pub fn named(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation`, retrying every failure.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_when(operation, |_| true).await
    }

    /// Run `operation`, retrying only failures for which `is_retryable` holds.
    pub async fn execute_when<T, E, F, Fut, C>(
        &self,
        operation: F,
        is_retryable: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        let mut tracker = AttemptTracker::default();
        self.run(operation, is_retryable, &mut tracker).await
    }

    pub(crate) async fn run<T, E, F, Fut, C>(
        &self,
        mut operation: F,
        is_retryable: C,
        tracker: &mut AttemptTracker,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        let max_retries = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracker.attempts = attempt;
            if attempt > 1 {
                debug!(operation = %self.name, attempt, max_retries, "retry attempt");
            }

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = %self.name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            tracker.last_error = Some(err.to_string());

            if !is_retryable(&err) {
                warn!(
                    operation = %self.name,
                    attempt,
                    error = %err,
                    "non-retryable failure"
                );
                return Err(RetryError::NonRetryable {
                    attempt,
                    error: err,
                });
            }

            if attempt >= max_retries {
                error!(
                    operation = %self.name,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error: err,
                });
            }

            let delay = self.config.delay_after_failure(attempt, &mut rand::rng());
            warn!(
                operation = %self.name,
                attempt,
                max_retries,
                error = %err,
                backoff_ms = delay.as_millis() as u64,
                "attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// One-call convenience over [`RetryPolicy::execute`].
pub async fn with_retry<T, E, F, Fut>(
    operation: F,
    config: &RetryConfig,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    RetryPolicy::new(config.clone()).execute(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_grows_exponentially_then_clamps() {
        let config = no_jitter(10);
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(5));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(10));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(20));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(40));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60));
        assert_eq!(config.backoff_for_attempt(500), Duration::from_secs(60));
    }

    #[test]
    fn jitter_perturbs_the_clamped_value() {
        let config = RetryConfig {
            jitter: true,
            ..no_jitter(10)
        };
        let clamped = config.backoff_for_attempt(8);
        assert_eq!(clamped, Duration::from_secs(60));
        assert_eq!(config.apply_jitter(clamped, 0.5), Duration::from_secs(30));
        assert_eq!(config.apply_jitter(clamped, 1.25), Duration::from_secs(75));
    }

    #[test]
    fn uncapped_jitter_saturates() {
        let config = RetryConfig {
            max_backoff: Duration::MAX,
            jitter: true,
            ..no_jitter(10)
        };
        let backoff = config.backoff_for_attempt(200);
        assert_eq!(backoff, Duration::MAX);
        assert_eq!(config.apply_jitter(backoff, 1.4), Duration::MAX);
        assert!(config.apply_jitter(backoff, 0.5) < Duration::MAX);

        let mut rng = rand::rng();
        assert!(config.delay_after_failure(200, &mut rng) > Duration::from_secs(3600));
    }

    #[test]
    fn network_preset() {
        let config = RetryConfig::network();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::named("fetch_nvd", no_jitter(3));
        let start = Instant::now();

        let result: Result<&str, RetryError<String>> = policy
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("timeout #{n}")) } else { Ok("feed") }
            })
            .await;

        assert_eq!(result.unwrap(), "feed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(15), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(15_100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_exhausts_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(no_jitter(4));

        let err = policy
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(format!("boom {n}"))
            })
            .await
            .unwrap_err();

        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.error(), "boom 4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(no_jitter(5));
        let start = Instant::now();

        let err = policy
            .execute_when(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("401 unauthorized".to_string())
                },
                |e: &String| !e.starts_with("401"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::NonRetryable { attempt: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn success_on_first_attempt_does_not_sleep() {
        let policy = RetryPolicy::new(no_jitter(3));
        let start = Instant::now();
        let value = policy.execute(|| async { Ok::<_, String>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_helper_and_anyhow_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("connection reset");
                }
                Ok(())
            },
            &no_jitter(2),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retry_error_display_includes_cause() {
        let err: RetryError<String> = RetryError::Exhausted {
            attempts: 3,
            error: "503 from nvd".into(),
        };
        assert_eq!(err.to_string(), "retries exhausted after 3 attempts: 503 from nvd");
        assert_eq!(err.into_inner(), "503 from nvd");
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_half_and_one_and_a_half(
            attempt in 1u32..40,
            initial_ms in 1u64..10_000,
            max_ms in 10_000u64..600_000,
        ) {
            let config = RetryConfig {
                max_retries: 50,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                multiplier: 2.0,
                jitter: true,
            };
            let base = config.backoff_for_attempt(attempt);
            prop_assert!(base <= config.max_backoff);

            let delay = config.delay_after_failure(attempt, &mut rand::rng());
            prop_assert!(delay >= base.mul_f64(0.5));
            prop_assert!(delay < base.mul_f64(1.5) + Duration::from_nanos(1));
        }
    }
}
