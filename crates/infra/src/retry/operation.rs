use std::fmt::Display;
use std::future::Future;

use super::policy::{AttemptTracker, RetryConfig, RetryError, RetryPolicy};

/// One-shot retried operation that keeps its attempt history around for
/// diagnostics after the call returns.
///
/// Each `execute*` call starts with fresh tracking.
#[derive(Debug, Clone)]
pub struct RetryableOperation {
    policy: RetryPolicy,
    tracker: AttemptTracker,
}

impl RetryableOperation {
    pub fn new(config: RetryConfig) -> Self {
        Self::named("operation", config)
    }

    pub fn named(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::named(name, config),
            tracker: AttemptTracker::default(),
        }
    }

    /// Attempts made by the last `execute*` call.
    pub fn attempts(&self) -> u32 {
        self.tracker.attempts
    }

    /// Error message of the most recent failed attempt, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.tracker.last_error.as_deref()
    }

    pub async fn execute<T, E, F, Fut>(&mut self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_when(operation, |_| true).await
    }

    pub async fn execute_when<T, E, F, Fut, C>(
        &mut self,
        operation: F,
        is_retryable: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        self.tracker = AttemptTracker::default();
        self.policy
            .run(operation, is_retryable, &mut self.tracker)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exposes_attempts_and_last_error_after_success() {
        let calls = AtomicU32::new(0);
        let mut op = RetryableOperation::named("github_search", config());

        let value = op
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("rate limited".to_string())
                } else {
                    Ok(5)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 5);
        assert_eq!(op.attempts(), 2);
        assert_eq!(op.last_error(), Some("rate limited"));
    }

    #[tokio::test(start_paused = true)]
    async fn exposes_final_error_after_exhaustion() {
        let mut op = RetryableOperation::new(config());

        let err = op
            .execute(|| async { Err::<(), _>("dns failure".to_string()) })
            .await
            .unwrap_err();

        assert!(err.is_exhausted());
        assert_eq!(op.attempts(), 3);
        assert_eq!(op.last_error(), Some("dns failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_resets_between_calls() {
        let mut op = RetryableOperation::new(config());
        let _ = op
            .execute(|| async { Err::<(), _>("first".to_string()) })
            .await;
        assert_eq!(op.attempts(), 3);

        op.execute(|| async { Ok::<_, String>(()) }).await.unwrap();
        assert_eq!(op.attempts(), 1);
        assert_eq!(op.last_error(), None);
    }
}
