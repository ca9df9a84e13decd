//! Run-record sink: where the scheduler writes the outcome of each attempted run.
//!
//! A durable implementation writes `agent_runs` rows; [`InMemoryRunRecorder`]
//! keeps them in memory for tests/dev.

pub mod in_memory;

use async_trait::async_trait;

use cvewatch_core::{AgentRun, DomainError, RunId, SkippedRun};

pub use in_memory::InMemoryRunRecorder;

/// Run-record sink error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordError {
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persists run-records for scheduled job executions.
#[async_trait]
pub trait RunRecorder: Send + Sync + 'static {
    /// Create a record in the `running` state for a run that is about to start.
    async fn start_run(&self, job_name: &str) -> Result<AgentRun, RecordError>;

    /// Store the final state of a run previously returned by `start_run`.
    async fn finish_run(&self, run: &AgentRun) -> Result<(), RecordError>;

    /// Note a trigger dropped because the job was still running.
    ///
    /// No run-record is created for skipped triggers; sinks that do not track
    /// skips can ignore them.
    async fn record_skip(&self, _skip: SkippedRun) -> Result<(), RecordError> {
        Ok(())
    }
}
