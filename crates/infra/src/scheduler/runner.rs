use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cvewatch_core::{AgentRun, RunId, RunResult, SkippedRun};

use crate::locks::{HeldLock, JobLockManager, LockError};
use crate::records::RunRecorder;

use super::job::{JobBody, JobDefinition, SessionFactory};
use super::trigger::{TriggerError, TriggerSpec};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the dispatch loop checks for due jobs.
    pub tick: Duration,
    /// How long `stop` waits for in-flight runs before abandoning them.
    pub shutdown_grace: Duration,
    /// Lock timeout for jobs that do not set their own.
    pub default_lock_timeout: Duration,
    /// Locks held longer than this are reported by the periodic leak check.
    pub leak_threshold: Duration,
    pub leak_check_interval: Duration,
    /// Offset from UTC in which calendar triggers read their hours.
    pub calendar_offset: FixedOffset,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            default_lock_timeout: Duration::from_secs(600),
            leak_threshold: Duration::from_secs(3600),
            leak_check_interval: Duration::from_secs(60),
            calendar_offset: Utc.fix(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_default_lock_timeout(mut self, timeout: Duration) -> Self {
        self.default_lock_timeout = timeout;
        self
    }

    pub fn with_calendar_offset(mut self, offset: FixedOffset) -> Self {
        self.calendar_offset = offset;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already started")]
    AlreadyStarted,
    #[error("scheduler is not started")]
    NotStarted,
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("invalid trigger for job '{job}': {source}")]
    Trigger {
        job: String,
        #[source]
        source: TriggerError,
    },
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub jobs_triggered: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub current_running: usize,
}

/// What happened to one triggered execution.
#[derive(Debug, Clone)]
pub enum JobRunOutcome {
    Succeeded(AgentRun),
    /// `run` is `None` when the failure happened before a run-record existed.
    Failed {
        run: Option<AgentRun>,
        error: String,
    },
    /// The previous invocation still held the lock; nothing ran.
    Skipped { held_for: Duration },
}

impl JobRunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobRunOutcome::Succeeded(_))
    }

    pub fn run(&self) -> Option<&AgentRun> {
        match self {
            JobRunOutcome::Succeeded(run) => Some(run),
            JobRunOutcome::Failed { run, .. } => run.as_ref(),
            JobRunOutcome::Skipped { .. } => None,
        }
    }
}

/// A registered job, as reported to dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub label: Option<String>,
    pub schedule: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub running: bool,
}

struct ScheduledJob<S> {
    definition: JobDefinition<S>,
    next_fire: Option<Instant>,
}

struct JobTable<S> {
    jobs: HashMap<String, ScheduledJob<S>>,
    started: bool,
}

struct Inner<F: SessionFactory, R> {
    table: Mutex<JobTable<F::Session>>,
    factory: F,
    recorder: R,
    locks: Arc<JobLockManager>,
    config: SchedulerConfig,
    stats: Mutex<SchedulerStats>,
    /// Scheduled runs whose body has not finished yet.
    in_flight: Mutex<HashMap<RunId, AgentRun>>,
    wake: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOrigin {
    Scheduled,
    Manual,
}

impl RunOrigin {
    fn as_str(self) -> &'static str {
        match self {
            RunOrigin::Scheduled => "scheduled",
            RunOrigin::Manual => "manual",
        }
    }
}

struct Dispatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs named jobs on their triggers.
///
/// Each fired job runs on its own task behind the execution wrapper:
/// job lock, then run-record, then session, then body, then cleanup. A body that
/// fails or panics becomes a failed run-record and affects nothing else.
pub struct Scheduler<F: SessionFactory, R: RunRecorder> {
    inner: Arc<Inner<F, R>>,
    dispatch: Mutex<Option<Dispatch>>,
}

impl<F: SessionFactory, R: RunRecorder> Scheduler<F, R> {
    pub fn new(
        factory: F,
        recorder: R,
        locks: Arc<JobLockManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(JobTable {
                    jobs: HashMap::new(),
                    started: false,
                }),
                factory,
                recorder,
                locks,
                config,
                stats: Mutex::new(SchedulerStats::default()),
                in_flight: Mutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
            dispatch: Mutex::new(None),
        }
    }

    /// Register `body` under `name`, replacing any job already registered under it.
    pub fn register_job(
        &self,
        name: impl Into<String>,
        trigger: TriggerSpec,
        body: impl JobBody<F::Session>,
    ) -> Result<(), SchedulerError> {
        self.register(JobDefinition::new(name, trigger, body))
    }

    /// Register a job definition.
    ///
    /// An existing job with the same name is superseded atomically: its
    /// pending fire is dropped and only the new trigger stays scheduled.
    pub fn register(&self, definition: JobDefinition<F::Session>) -> Result<(), SchedulerError> {
        definition
            .trigger()
            .validate()
            .map_err(|source| SchedulerError::Trigger {
                job: definition.name().to_string(),
                source,
            })?;

        let name = definition.name().to_string();
        let label = definition.display_name().to_string();
        let schedule = definition.trigger().to_string();
        let wall = self.inner.wall_clock();
        let (replaced, unschedulable) = {
            let mut table = self.inner.table();
            let started = table.started;
            let next_fire = started
                .then(|| definition.trigger().first_fire(Instant::now(), wall))
                .flatten();
            let replaced = table
                .jobs
                .insert(
                    name.clone(),
                    ScheduledJob {
                        definition,
                        next_fire,
                    },
                )
                .is_some();
            (replaced, started && next_fire.is_none())
        };

        if replaced {
            info!(
                job = %name,
                label = %label,
                schedule = %schedule,
                "job re-registered; previous schedule replaced"
            );
        } else {
            info!(job = %name, label = %label, schedule = %schedule, "job registered");
        }
        if unschedulable {
            warn!(job = %name, schedule = %schedule, "trigger has no representable fire time");
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Remove a job from the schedule. A run already in flight is not affected.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.table().jobs.remove(name).is_some();
        if removed {
            info!(job = name, "job unregistered");
        }
        removed
    }

    /// Start the dispatch loop. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        if dispatch.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let job_count = {
            let mut table = self.inner.table();
            let now = Instant::now();
            let wall = self.inner.wall_clock();
            table.started = true;
            for (name, job) in table.jobs.iter_mut() {
                job.next_fire = job.definition.trigger().first_fire(now, wall);
                if job.next_fire.is_none() {
                    warn!(job = %name, "trigger has no representable fire time");
                }
            }
            table.jobs.len()
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(Arc::clone(&self.inner), cancel.clone()));
        *dispatch = Some(Dispatch { cancel, handle });

        info!(jobs = job_count, "scheduler started");
        Ok(())
    }

    /// Stop firing triggers and wait for in-flight runs.
    ///
    /// Runs still going after the shutdown grace period are aborted; their
    /// job locks are released as the runs are dropped and their run-records
    /// are closed as failed.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let dispatch = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SchedulerError::NotStarted)?;

        {
            let mut table = self.inner.table();
            table.started = false;
            for job in table.jobs.values_mut() {
                job.next_fire = None;
            }
        }

        dispatch.cancel.cancel();
        if let Err(err) = dispatch.handle.await {
            error!(error = %err, "scheduler dispatch loop ended abnormally");
        }

        info!("scheduler stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run a registered job now, through the same wrapper as a scheduled fire.
    ///
    /// Does not move the job's next scheduled fire.
    pub async fn run_now(&self, name: &str) -> Result<JobRunOutcome, SchedulerError> {
        let definition = self
            .inner
            .table()
            .jobs
            .get(name)
            .map(|job| job.definition.clone())
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;

        info!(job = name, "manual run requested");
        Ok(Arc::clone(&self.inner)
            .execute(definition, RunOrigin::Manual)
            .await)
    }

    /// Currently held job locks with their ages.
    pub fn running_jobs(&self) -> Vec<HeldLock> {
        self.inner.locks.running_jobs()
    }

    /// Registered jobs sorted by name.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let now = Instant::now();
        let wall = Utc::now();
        let mut jobs: Vec<JobInfo> = self
            .inner
            .table()
            .jobs
            .iter()
            .map(|(name, job)| JobInfo {
                name: name.clone(),
                label: job.definition.label().map(str::to_string),
                schedule: job.definition.trigger().to_string(),
                next_fire: job.next_fire.map(|at| {
                    let ahead = at.saturating_duration_since(now);
                    wall + chrono::Duration::from_std(ahead).unwrap_or_default()
                }),
                running: self.inner.locks.is_running(name),
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats().clone()
    }

    pub fn locks(&self) -> &Arc<JobLockManager> {
        &self.inner.locks
    }
}

impl<F: SessionFactory, R: RunRecorder> Drop for Scheduler<F, R> {
    fn drop(&mut self) {
        let dispatch = self.dispatch.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(dispatch) = dispatch.take() {
            dispatch.cancel.cancel();
        }
    }
}

impl<F: SessionFactory, R: RunRecorder> Inner<F, R> {
    fn table(&self) -> MutexGuard<'_, JobTable<F::Session>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, SchedulerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<RunId, AgentRun>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current wall-clock time in the calendar offset.
    fn wall_clock(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.config.calendar_offset)
    }

    /// Collect every job due at `now` and schedule its following fire.
    fn take_due(&self, now: Instant) -> Vec<JobDefinition<F::Session>> {
        let wall = self.wall_clock();
        let mut table = self.table();
        if !table.started {
            return Vec::new();
        }

        let mut due = Vec::new();
        let mut finished = Vec::new();
        for (name, job) in table.jobs.iter_mut() {
            let Some(at) = job.next_fire else { continue };
            if at > now {
                continue;
            }
            due.push(job.definition.clone());
            job.next_fire = job.definition.trigger().next_fire(at, now, wall);
            if job.next_fire.is_none() {
                finished.push(name.clone());
            }
        }
        for name in finished {
            table.jobs.remove(&name);
            debug!(job = %name, "no further fires; job removed from schedule");
        }
        due
    }

    /// The execution wrapper applied to every fire.
    async fn execute(
        self: Arc<Self>,
        definition: JobDefinition<F::Session>,
        origin: RunOrigin,
    ) -> JobRunOutcome {
        let job = definition.name();
        self.stats().jobs_triggered += 1;

        let timeout = definition
            .lock_timeout()
            .unwrap_or(self.config.default_lock_timeout);
        let _lock = match self.locks.guard(job, timeout) {
            Ok(guard) => guard,
            Err(LockError::AlreadyRunning { held_for, .. }) => {
                self.stats().jobs_skipped += 1;
                if let Err(err) = self.recorder.record_skip(SkippedRun::new(job, held_for)).await {
                    warn!(job, error = %err, "failed to record skipped run");
                }
                return JobRunOutcome::Skipped { held_for };
            }
        };
        let _slot = RunningSlot::enter(&self.stats);

        let mut run = match self.recorder.start_run(job).await {
            Ok(run) => run,
            Err(err) => {
                error!(job, error = %err, "failed to create run record; job not run");
                self.stats().jobs_failed += 1;
                return JobRunOutcome::Failed {
                    run: None,
                    error: err.to_string(),
                };
            }
        };
        info!(
            job,
            label = definition.display_name(),
            run_id = %run.id,
            origin = origin.as_str(),
            "job started"
        );
        if origin == RunOrigin::Scheduled {
            self.in_flight().insert(run.id, run.clone());
        }

        let body_result = self.run_body(definition.body().as_ref()).await;
        self.in_flight().remove(&run.id);
        let closed = match body_result {
            Ok(result) => run.complete(&result),
            Err(message) => run.fail(message),
        };
        if let Err(err) = closed {
            // Only reachable when the body reports `Running`.
            if let Err(err) = run.fail(err.to_string()) {
                error!(job, error = %err, "could not close run record");
            }
        }

        if let Err(err) = self.recorder.finish_run(&run).await {
            error!(job, run_id = %run.id, error = %err, "failed to store run record");
        }

        let duration_ms = run.duration_ms().unwrap_or_default();
        if run.status == cvewatch_core::RunStatus::Success {
            self.stats().jobs_succeeded += 1;
            info!(
                job,
                run_id = %run.id,
                items_collected = run.items_collected,
                items_processed = run.items_processed,
                duration_ms,
                "job completed"
            );
            JobRunOutcome::Succeeded(run)
        } else {
            self.stats().jobs_failed += 1;
            let error = run.error_message.clone().unwrap_or_default();
            error!(job, run_id = %run.id, error = %error, duration_ms, "job failed");
            JobRunOutcome::Failed {
                run: Some(run),
                error,
            }
        }
    }

    /// Open a session, run the body, close the session. Errors and panics
    /// come back as the message to record.
    async fn run_body(&self, body: &dyn JobBody<F::Session>) -> Result<RunResult, String> {
        let mut session = self
            .factory
            .open()
            .await
            .map_err(|err| format!("failed to open session: {err:#}"))?;

        let outcome = AssertUnwindSafe(body.run(&mut session)).catch_unwind().await;
        self.factory.close(session).await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => Err(format!("job panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    /// Close the run-records of scheduled runs that were aborted before
    /// their body finished.
    async fn fail_aborted_runs(&self) {
        let aborted: Vec<AgentRun> = self.in_flight().drain().map(|(_, run)| run).collect();
        for mut run in aborted {
            if let Err(err) = run.fail(ABORTED_AT_SHUTDOWN) {
                error!(job = %run.agent_name, error = %err, "could not close run record");
                continue;
            }
            self.stats().jobs_failed += 1;
            match self.recorder.finish_run(&run).await {
                Ok(()) => warn!(job = %run.agent_name, run_id = %run.id, "run aborted at shutdown"),
                Err(err) => {
                    error!(
                        job = %run.agent_name,
                        run_id = %run.id,
                        error = %err,
                        "failed to store aborted run record"
                    );
                }
            }
        }
    }
}

/// Error message recorded for runs cut off by the shutdown grace period.
pub const ABORTED_AT_SHUTDOWN: &str = "aborted at shutdown";

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Counts a run in `current_running` for as long as it lives, including
/// when the run is aborted at shutdown.
struct RunningSlot<'a>(&'a Mutex<SchedulerStats>);

impl<'a> RunningSlot<'a> {
    fn enter(stats: &'a Mutex<SchedulerStats>) -> Self {
        stats.lock().unwrap_or_else(PoisonError::into_inner).current_running += 1;
        Self(stats)
    }
}

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        let mut stats = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        stats.current_running = stats.current_running.saturating_sub(1);
    }
}

async fn dispatch_loop<F: SessionFactory, R: RunRecorder>(
    inner: Arc<Inner<F, R>>,
    cancel: CancellationToken,
) {
    // `interval` panics on a zero period.
    let floor = Duration::from_millis(1);
    let mut ticker = tokio::time::interval(inner.config.tick.max(floor));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let leak_every = inner.config.leak_check_interval.max(floor);
    let leak_start = Instant::now().checked_add(leak_every).unwrap_or_else(Instant::now);
    let mut leak_ticker = tokio::time::interval_at(leak_start, leak_every);
    leak_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = inner.wake.notified() => {}
            _ = leak_ticker.tick() => {
                inner.locks.check_for_leaks(inner.config.leak_threshold);
                continue;
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = joined {
                    error!(error = %err, "job task ended abnormally");
                }
                continue;
            }
        }

        for definition in inner.take_due(Instant::now()) {
            debug!(job = definition.name(), "trigger fired");
            running.spawn(Arc::clone(&inner).execute(definition, RunOrigin::Scheduled));
        }
    }

    drain(&inner, &mut running).await;
}

async fn drain<F: SessionFactory, R: RunRecorder>(
    inner: &Inner<F, R>,
    running: &mut JoinSet<JobRunOutcome>,
) {
    if running.is_empty() {
        return;
    }

    let grace = inner.config.shutdown_grace;

    info!(
        in_flight = running.len(),
        grace_secs = grace.as_secs_f64(),
        "waiting for running jobs to finish"
    );
    let finished = tokio::time::timeout(grace, async {
        while running.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(
            abandoned = running.len(),
            "shutdown grace period elapsed; aborting running jobs"
        );
        running.shutdown().await;
        inner.fail_aborted_runs().await;
    }
}
