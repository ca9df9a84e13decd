use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use super::manager::{JobLockManager, LockToken};

/// Scoped-acquisition failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("job '{job}' is already running (started {}s ago)", held_for.as_secs())]
    AlreadyRunning { job: String, held_for: Duration },
}

/// Holds a job lock until dropped.
///
/// Dropping releases the lock on every exit path, including early returns,
/// panics and cancelled futures.
#[derive(Debug)]
#[must_use = "the job lock is released as soon as the guard is dropped"]
pub struct JobLockGuard {
    manager: Arc<JobLockManager>,
    job_name: String,
    token: LockToken,
}

impl JobLockGuard {
    pub(crate) fn new(manager: Arc<JobLockManager>, job_name: String, token: LockToken) -> Self {
        Self {
            manager,
            job_name,
            token,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn token(&self) -> LockToken {
        self.token
    }
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        self.manager.release_token(&self.job_name, self.token);
    }
}

/// Run `body` while holding the lock for `job_name`.
///
/// Fails with [`LockError::AlreadyRunning`] without running `body` if the job is
/// already running. Errors returned by `body` are logged and passed through.
pub async fn with_job_lock<T, E, Fut>(
    manager: &Arc<JobLockManager>,
    job_name: &str,
    timeout: Duration,
    body: Fut,
) -> Result<Result<T, E>, LockError>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let _guard = manager.guard(job_name, timeout)?;
    let result = body.await;
    if let Err(err) = &result {
        error!(job = job_name, error = %err, "job failed while holding its lock");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(600);

    #[test]
    fn guard_releases_on_drop() {
        let locks = JobLockManager::arc();
        {
            let guard = locks.guard("cve_collector", TIMEOUT).unwrap();
            assert_eq!(guard.job_name(), "cve_collector");
            assert!(locks.is_running("cve_collector"));
        }
        assert!(!locks.is_running("cve_collector"));
    }

    #[test]
    fn guard_fails_fast_when_already_running() {
        let locks = JobLockManager::arc();
        let _held = locks.guard("cve_collector", TIMEOUT).unwrap();

        let err = locks.guard("cve_collector", TIMEOUT).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { ref job, .. } if job == "cve_collector"));
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn guard_releases_when_body_panics() {
        let locks = JobLockManager::arc();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = locks.guard("poc_hunter", TIMEOUT).unwrap();
            panic!("agent crashed");
        }));
        assert!(result.is_err());
        assert!(!locks.is_running("poc_hunter"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_guard_drop_keeps_new_holder() {
        let locks = JobLockManager::arc();
        let stale = locks.guard("x", Duration::from_secs(1)).unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        let fresh = locks.guard("x", Duration::from_secs(1)).unwrap();

        drop(stale);
        assert!(locks.is_running("x"));
        drop(fresh);
        assert!(!locks.is_running("x"));
    }

    #[tokio::test]
    async fn with_job_lock_releases_after_error() {
        let locks = JobLockManager::arc();

        let outcome = with_job_lock(&locks, "darknet_scraper", TIMEOUT, async {
            Err::<(), _>("tor circuit failed")
        })
        .await
        .unwrap();

        assert!(outcome.is_err());
        assert!(!locks.is_running("darknet_scraper"));
    }

    #[tokio::test]
    async fn with_job_lock_skips_body_when_held() {
        let locks = JobLockManager::arc();
        let _held = locks.guard("darknet_scraper", TIMEOUT).unwrap();

        let mut ran = false;
        let outcome = with_job_lock(&locks, "darknet_scraper", TIMEOUT, async {
            ran = true;
            Ok::<_, String>(())
        })
        .await;

        assert!(matches!(outcome, Err(LockError::AlreadyRunning { .. })));
        assert!(!ran);
    }
}
