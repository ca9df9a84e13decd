//! What the scheduler runs: job bodies, their sessions, and job definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use cvewatch_core::RunResult;

use super::trigger::TriggerSpec;

/// Opens and closes the per-run resource handle (e.g. a database session).
///
/// Every execution gets its own session; sessions are never shared between
/// concurrent runs.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + 'static;

    async fn open(&self) -> anyhow::Result<Self::Session>;

    /// Called after the body returns, fails or panics.
    async fn close(&self, session: Self::Session);
}

/// Factory for jobs that need no per-run resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSessions;

#[async_trait]
impl SessionFactory for NoSessions {
    type Session = ();

    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self, _session: ()) {}
}

/// A scheduled unit of work.
///
/// Returning `Err` (or panicking) records the run as failed; a body may also
/// report failure through [`RunResult::failed`].
#[async_trait]
pub trait JobBody<S>: Send + Sync + 'static {
    async fn run(&self, session: &mut S) -> anyhow::Result<RunResult>;
}

/// Adapts a closure into a [`JobBody`].
///
/// ```ignore
/// job_fn(|_session: &mut ()| async { Ok(RunResult::success(0, 0)) }.boxed())
/// ```
pub fn job_fn<S, F>(f: F) -> FnJob<F>
where
    S: Send,
    F: for<'a> Fn(&'a mut S) -> BoxFuture<'a, anyhow::Result<RunResult>> + Send + Sync + 'static,
{
    FnJob(f)
}

/// Closure-backed job body; see [`job_fn`].
pub struct FnJob<F>(F);

#[async_trait]
impl<S, F> JobBody<S> for FnJob<F>
where
    S: Send,
    F: for<'a> Fn(&'a mut S) -> BoxFuture<'a, anyhow::Result<RunResult>> + Send + Sync + 'static,
{
    async fn run(&self, session: &mut S) -> anyhow::Result<RunResult> {
        (self.0)(session).await
    }
}

/// A named job with its trigger and body.
///
/// `name` identifies the job and keys its lock and run-records; `label` is an
/// optional human-readable title shown in logs and job listings.
pub struct JobDefinition<S> {
    name: String,
    label: Option<String>,
    trigger: TriggerSpec,
    lock_timeout: Option<Duration>,
    body: Arc<dyn JobBody<S>>,
}

impl<S> JobDefinition<S> {
    pub fn new(name: impl Into<String>, trigger: TriggerSpec, body: impl JobBody<S>) -> Self {
        Self::from_arc(name, trigger, Arc::new(body))
    }

    pub fn from_arc(
        name: impl Into<String>,
        trigger: TriggerSpec,
        body: Arc<dyn JobBody<S>>,
    ) -> Self {
        Self {
            name: name.into(),
            label: None,
            trigger,
            lock_timeout: None,
            body,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Override the scheduler-wide lock timeout for this job.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The label, falling back to the name.
    pub fn display_name(&self) -> &str {
        self.label().unwrap_or(self.name.as_str())
    }

    pub fn trigger(&self) -> &TriggerSpec {
        &self.trigger
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout
    }

    pub(crate) fn body(&self) -> &Arc<dyn JobBody<S>> {
        &self.body
    }
}

impl<S> Clone for JobDefinition<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            label: self.label.clone(),
            trigger: self.trigger.clone(),
            lock_timeout: self.lock_timeout,
            body: Arc::clone(&self.body),
        }
    }
}

impl<S> fmt::Debug for JobDefinition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("trigger", &self.trigger)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
