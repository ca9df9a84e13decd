use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::guard::{JobLockGuard, LockError};

/// Identifies one particular holder of a job lock.
///
/// A holder whose lock was taken over keeps its stale token, so its release
/// cannot remove the new holder's entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(u64);

/// Result of [`JobLockManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    /// No previous holder.
    Granted { token: LockToken },
    /// The previous holder exceeded the timeout and was presumed dead.
    TakenOver {
        token: LockToken,
        stale_for: Duration,
    },
    /// The job is still running within its timeout.
    Denied { held_for: Duration },
}

impl LockAcquisition {
    pub fn is_granted(&self) -> bool {
        !matches!(self, LockAcquisition::Denied { .. })
    }

    pub fn token(&self) -> Option<LockToken> {
        match self {
            LockAcquisition::Granted { token } | LockAcquisition::TakenOver { token, .. } => {
                Some(*token)
            }
            LockAcquisition::Denied { .. } => None,
        }
    }
}

/// A currently held lock, as reported to dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldLock {
    pub job_name: String,
    pub acquired_at: DateTime<Utc>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: LockToken,
    acquired: Instant,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<String, LockEntry>,
    next_token: u64,
}

/// In-process lock table preventing overlapping runs of the same job.
///
/// One mutex covers every read-modify-write on the table. The timeout-based
/// takeover is a liveness heuristic: the previous execution is not stopped,
/// only its lock is reclaimed.
#[derive(Debug, Default)]
pub struct JobLockManager {
    table: Mutex<LockTable>,
}

impl JobLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to take the lock for `job_name`.
    ///
    /// A lock older than `timeout` is presumed abandoned and taken over.
    pub fn acquire(&self, job_name: &str, timeout: Duration) -> LockAcquisition {
        let now = Instant::now();
        let mut table = self.table();

        let stale_for = match table.entries.get(job_name) {
            Some(entry) => {
                let age = now.saturating_duration_since(entry.acquired);
                if age <= timeout {
                    warn!(
                        job = job_name,
                        held_for_secs = age.as_secs_f64(),
                        "job is already running; skipping concurrent execution"
                    );
                    return LockAcquisition::Denied { held_for: age };
                }
                Some(age)
            }
            None => None,
        };

        table.next_token += 1;
        let token = LockToken(table.next_token);
        table.entries.insert(
            job_name.to_string(),
            LockEntry {
                token,
                acquired: now,
                acquired_at: Utc::now(),
            },
        );

        match stale_for {
            Some(stale_for) => {
                warn!(
                    job = job_name,
                    stale_for_secs = stale_for.as_secs_f64(),
                    timeout_secs = timeout.as_secs_f64(),
                    "job exceeded its lock timeout; assuming it crashed and taking over the lock"
                );
                LockAcquisition::TakenOver { token, stale_for }
            }
            None => {
                debug!(job = job_name, "lock acquired");
                LockAcquisition::Granted { token }
            }
        }
    }

    /// Release the lock for `job_name`. Releasing a lock nobody holds is a no-op.
    pub fn release(&self, job_name: &str) -> bool {
        let released = self.table().entries.remove(job_name).is_some();
        if released {
            debug!(job = job_name, "lock released");
        }
        released
    }

    /// Release only if `token` still identifies the current holder.
    pub fn release_token(&self, job_name: &str, token: LockToken) -> bool {
        let mut table = self.table();
        match table.entries.get(job_name) {
            Some(entry) if entry.token == token => {
                table.entries.remove(job_name);
                debug!(job = job_name, "lock released");
                true
            }
            Some(_) => {
                debug!(
                    job = job_name,
                    "lock was taken over by a newer holder; leaving it in place"
                );
                false
            }
            None => false,
        }
    }

    /// Acquire a lock released automatically when the guard drops.
    ///
    /// Fails fast with [`LockError::AlreadyRunning`] instead of skipping.
    pub fn guard(
        self: &Arc<Self>,
        job_name: &str,
        timeout: Duration,
    ) -> Result<JobLockGuard, LockError> {
        match self.acquire(job_name, timeout) {
            LockAcquisition::Granted { token } | LockAcquisition::TakenOver { token, .. } => {
                Ok(JobLockGuard::new(Arc::clone(self), job_name.to_string(), token))
            }
            LockAcquisition::Denied { held_for } => Err(LockError::AlreadyRunning {
                job: job_name.to_string(),
                held_for,
            }),
        }
    }

    pub fn is_running(&self, job_name: &str) -> bool {
        self.table().entries.contains_key(job_name)
    }

    /// Every held lock with its age, oldest first.
    pub fn running_jobs(&self) -> Vec<HeldLock> {
        let now = Instant::now();
        let mut held: Vec<HeldLock> = self
            .table()
            .entries
            .iter()
            .map(|(name, entry)| HeldLock {
                job_name: name.clone(),
                acquired_at: entry.acquired_at,
                elapsed: now.saturating_duration_since(entry.acquired),
            })
            .collect();
        held.sort_by(|a, b| b.elapsed.cmp(&a.elapsed).then_with(|| a.job_name.cmp(&b.job_name)));
        held
    }

    /// Warn about every lock held longer than `max_age`. Nothing is released.
    pub fn check_for_leaks(&self, max_age: Duration) -> Vec<HeldLock> {
        let leaked: Vec<HeldLock> = self
            .running_jobs()
            .into_iter()
            .filter(|lock| lock.elapsed > max_age)
            .collect();

        for lock in &leaked {
            warn!(
                job = %lock.job_name,
                held_for_secs = lock.elapsed.as_secs_f64(),
                max_age_secs = max_age.as_secs_f64(),
                "possible leaked job lock"
            );
        }
        leaked
    }
}
