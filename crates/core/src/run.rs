//! Run-record types: the audit trail of scheduled job executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::RunId;

/// Lifecycle status of a recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job body reports back when it returns normally.
///
/// A body may still report `Failed` (e.g. the feed was unreachable but the
/// body chose to swallow the error); the run is then recorded as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub items_collected: u64,
    pub items_processed: u64,
    pub error_message: Option<String>,
}

impl RunResult {
    pub fn success(items_collected: u64, items_processed: u64) -> Self {
        Self {
            status: RunStatus::Success,
            items_collected,
            items_processed,
            error_message: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            items_collected: 0,
            items_processed: 0,
            error_message: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Persisted record of one attempted job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: RunId,
    pub agent_name: String,
    pub status: RunStatus,
    pub items_collected: u64,
    pub items_processed: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl AgentRun {
    /// Open a new record in the `running` state.
    pub fn start(agent_name: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            agent_name: agent_name.into(),
            status: RunStatus::Running,
            items_collected: 0,
            items_processed: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Close the record with the body's reported result.
    pub fn complete(&mut self, result: &RunResult) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "run {} already finished as {}",
                self.id, self.status
            )));
        }
        if !result.status.is_terminal() {
            return Err(DomainError::validation(
                "a run cannot be completed with status running",
            ));
        }

        self.status = result.status;
        self.items_collected = result.items_collected;
        self.items_processed = result.items_processed;
        self.error_message = match (&result.error_message, result.status) {
            (Some(msg), _) => Some(msg.clone()),
            (None, RunStatus::Failed) => Some("job reported failure".to_string()),
            (None, _) => None,
        };
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Close the record as failed with the given error message.
    pub fn fail(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.complete(&RunResult::failed(error))
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds().max(0))
    }
}

/// A trigger that fired while the previous invocation still held the job lock.
///
/// Kept apart from [`AgentRun`]: nothing was attempted, so no run exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRun {
    pub job_name: String,
    pub skipped_at: DateTime<Utc>,
    /// How long the current holder had been running when the trigger fired.
    pub held_for_ms: u64,
}

impl SkippedRun {
    pub fn new(job_name: impl Into<String>, held_for: std::time::Duration) -> Self {
        Self {
            job_name: job_name.into(),
            skipped_at: Utc::now(),
            held_for_ms: held_for.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_is_running() {
        let run = AgentRun::start("cve_collector");
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.agent_name, "cve_collector");
        assert!(run.completed_at.is_none());
        assert!(run.duration_ms().is_none());
    }

    #[test]
    fn complete_copies_counts() {
        let mut run = AgentRun::start("cve_collector");
        run.complete(&RunResult::success(25, 24)).unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.items_collected, 25);
        assert_eq!(run.items_processed, 24);
        assert!(run.error_message.is_none());
        assert!(run.completed_at.is_some());
        assert!(run.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn fail_records_message() {
        let mut run = AgentRun::start("darknet_scraper");
        run.fail("feed unreachable").unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("feed unreachable"));
    }

    #[test]
    fn reported_failure_without_message_gets_one() {
        let mut run = AgentRun::start("poc_hunter");
        let result = RunResult {
            status: RunStatus::Failed,
            items_collected: 0,
            items_processed: 0,
            error_message: None,
        };
        run.complete(&result).unwrap();
        assert!(run.error_message.is_some());
    }

    #[test]
    fn cannot_finish_twice() {
        let mut run = AgentRun::start("cve_collector");
        run.complete(&RunResult::success(1, 1)).unwrap();

        let err = run.fail("late failure").unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(run.status, RunStatus::Success);
    }

    #[test]
    fn cannot_complete_with_running_status() {
        let mut run = AgentRun::start("cve_collector");
        let result = RunResult {
            status: RunStatus::Running,
            items_collected: 0,
            items_processed: 0,
            error_message: None,
        };
        assert!(matches!(
            run.complete(&result),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::Success).unwrap();
        assert_eq!(json, "\"success\"");
        assert_eq!(RunStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn skipped_run_captures_hold_time() {
        let skip = SkippedRun::new("daily", std::time::Duration::from_millis(1500));
        assert_eq!(skip.job_name, "daily");
        assert_eq!(skip.held_for_ms, 1500);
    }
}
