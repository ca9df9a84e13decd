use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use cvewatch_core::{AgentRun, RunId, RunStatus, SkippedRun};

use super::{RecordError, RunRecorder};

/// In-memory run-record sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRunRecorder {
    runs: RwLock<HashMap<RunId, AgentRun>>,
    skips: RwLock<Vec<SkippedRun>>,
}

impl InMemoryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All runs, oldest first.
    pub fn runs(&self) -> Vec<AgentRun> {
        let mut runs: Vec<AgentRun> = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.id);
        runs
    }

    /// Runs of one job, oldest first.
    pub fn runs_for(&self, job_name: &str) -> Vec<AgentRun> {
        self.runs()
            .into_iter()
            .filter(|r| r.agent_name == job_name)
            .collect()
    }

    pub fn latest(&self, job_name: &str) -> Option<AgentRun> {
        self.runs_for(job_name).pop()
    }

    pub fn count_with_status(&self, status: RunStatus) -> usize {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    pub fn skips(&self) -> Vec<SkippedRun> {
        self.skips
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RunRecorder for InMemoryRunRecorder {
    async fn start_run(&self, job_name: &str) -> Result<AgentRun, RecordError> {
        let run = AgentRun::start(job_name);
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.id, run.clone());
        Ok(run)
    }

    async fn finish_run(&self, run: &AgentRun) -> Result<(), RecordError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let stored = runs.get_mut(&run.id).ok_or(RecordError::NotFound(run.id))?;
        *stored = run.clone();
        Ok(())
    }

    async fn record_skip(&self, skip: SkippedRun) -> Result<(), RecordError> {
        self.skips
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(skip);
        Ok(())
    }
}

#[async_trait]
impl<R: RunRecorder> RunRecorder for Arc<R> {
    async fn start_run(&self, job_name: &str) -> Result<AgentRun, RecordError> {
        (**self).start_run(job_name).await
    }

    async fn finish_run(&self, run: &AgentRun) -> Result<(), RecordError> {
        (**self).finish_run(run).await
    }

    async fn record_skip(&self, skip: SkippedRun) -> Result<(), RecordError> {
        (**self).record_skip(skip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvewatch_core::RunResult;
    use std::time::Duration;

    #[tokio::test]
    async fn start_then_finish() {
        let recorder = InMemoryRunRecorder::new();
        let mut run = recorder.start_run("cve_collector").await.unwrap();
        assert_eq!(recorder.count_with_status(RunStatus::Running), 1);

        run.complete(&RunResult::success(10, 10)).unwrap();
        recorder.finish_run(&run).await.unwrap();

        let latest = recorder.latest("cve_collector").unwrap();
        assert_eq!(latest.status, RunStatus::Success);
        assert_eq!(latest.items_collected, 10);
        assert_eq!(recorder.count_with_status(RunStatus::Running), 0);
    }

    #[tokio::test]
    async fn finishing_unknown_run_fails() {
        let recorder = InMemoryRunRecorder::new();
        let run = AgentRun::start("ghost");
        let err = recorder.finish_run(&run).await.unwrap_err();
        assert!(matches!(err, RecordError::NotFound(id) if id == run.id));
    }

    #[tokio::test]
    async fn runs_are_grouped_by_job() {
        let recorder = InMemoryRunRecorder::arc();
        recorder.start_run("a").await.unwrap();
        recorder.start_run("b").await.unwrap();
        recorder.start_run("a").await.unwrap();

        assert_eq!(recorder.runs().len(), 3);
        assert_eq!(recorder.runs_for("a").len(), 2);
        assert!(recorder.latest("c").is_none());
    }

    #[tokio::test]
    async fn skips_are_kept_apart_from_runs() {
        let recorder = InMemoryRunRecorder::new();
        recorder
            .record_skip(SkippedRun::new("daily", Duration::from_secs(3)))
            .await
            .unwrap();

        assert!(recorder.runs().is_empty());
        assert_eq!(recorder.skips().len(), 1);
        assert_eq!(recorder.skips()[0].job_name, "daily");
    }
}
