//! Recurring job scheduler.
//!
//! - Jobs are registered by name with a [`TriggerSpec`]; re-registering a name
//!   replaces the previous job
//! - A single dispatch loop fires due triggers; every fired job runs on its
//!   own task
//! - Each run goes through the same wrapper: job lock, run-record, session,
//!   body, cleanup
//! - A trigger that fires while the previous run still holds the lock is
//!   dropped and reported as a [`cvewatch_core::SkippedRun`]
//! - Runs still going when the shutdown grace period ends are aborted and
//!   their run-records closed as failed

pub mod job;
pub mod runner;
pub mod trigger;

pub use job::{job_fn, FnJob, JobBody, JobDefinition, NoSessions, SessionFactory};
pub use runner::{
    ABORTED_AT_SHUTDOWN, JobInfo, JobRunOutcome, Scheduler, SchedulerConfig, SchedulerError, SchedulerStats,
};
pub use trigger::{TriggerError, TriggerSpec};
