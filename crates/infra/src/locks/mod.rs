//! In-process job locks preventing overlapping runs of the same job.
//!
//! Locks are keyed by job name and live only in this process. A lock older than
//! its timeout is presumed abandoned and taken over by the next trigger; the
//! abandoned execution itself keeps running.

pub mod guard;
pub mod manager;

pub use guard::{with_job_lock, JobLockGuard, LockError};
pub use manager::{HeldLock, JobLockManager, LockAcquisition, LockToken};
