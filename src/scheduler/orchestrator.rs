use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ScheduleConfig;
use crate::error::{Result, SyncError};
use crate::scheduler::job::{Job, JobSnapshot, JobState, Routine};
use crate::scheduler::metrics::{MetricsRecorder, RunOutcome};

/// Result of asking the scheduler to start a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The run was launched.
    Created,
    /// A run of this job is already in progress.
    Conflict,
    /// No job is registered under that name.
    NotFound,
}

/// Owns the job registry and decides when each job runs.
///
/// Jobs are registered once at startup; afterwards the scheduler is shared
/// behind an `Arc` between the timer loop, the HTTP trigger surface and the
/// shutdown path. Each accepted trigger launches one tracked task; at most one
/// task per job exists at any time.
pub struct Scheduler {
    jobs: HashMap<String, Arc<Job>>,
    metrics: Arc<dyn MetricsRecorder>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            jobs: HashMap::new(),
            metrics,
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Add a job. A duplicate name is a configuration error.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        routine: Arc<dyn Routine>,
        config: ScheduleConfig,
    ) -> Result<()> {
        let name = name.into();
        if self.jobs.contains_key(&name) {
            return Err(SyncError::DuplicateJob(name));
        }

        self.metrics.job_registered(&name);
        tracing::info!(
            job = %name,
            enabled = config.enabled,
            interval_secs = config.interval.as_secs(),
            "Job registered"
        );
        self.jobs
            .insert(name.clone(), Arc::new(Job::new(name, routine, config)));
        Ok(())
    }

    /// Start `name` unless it is unknown or already running. Never waits for
    /// the run to finish.
    pub fn trigger(&self, name: &str) -> TriggerOutcome {
        let Some(job) = self.jobs.get(name) else {
            tracing::debug!(job = name, "Trigger for unknown job");
            return TriggerOutcome::NotFound;
        };

        if !job.run_state().try_start() {
            tracing::warn!(job = name, "Can't start job because it is already in progress");
            return TriggerOutcome::Conflict;
        }

        job.schedule().mark_started(Instant::now());
        self.metrics.job_started(name);
        tracing::info!(job = name, "Job started");

        let job = Arc::clone(job);
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let routine = job.routine();
            let token = cancel.clone();
            let result = match tokio::spawn(async move { routine.run(token).await }).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(SyncError::RoutinePanicked(job.name().to_string())),
                Err(e) => Err(SyncError::Internal(e.to_string())),
            };

            let outcome = match &result {
                Ok(()) => {
                    if cancel.is_cancelled() {
                        tracing::info!(job = job.name(), "Job cancelled");
                    }
                    RunOutcome::Succeeded
                }
                Err(SyncError::Cancelled) => {
                    tracing::info!(job = job.name(), "Job cancelled");
                    RunOutcome::Succeeded
                }
                Err(e) => {
                    tracing::error!(job = job.name(), error = %e, "Job failed");
                    RunOutcome::Failed
                }
            };

            job.record(outcome);
            metrics.job_finished(job.name(), outcome);
            job.run_state().finish();
            tracing::info!(job = job.name(), "Job ended");
        });

        TriggerOutcome::Created
    }

    /// Trigger every enabled job whose interval has elapsed. Running jobs are
    /// skipped rather than waited on. Returns the names that were started.
    pub fn tick(&self) -> Vec<String> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }

        let now = Instant::now();
        let mut started = Vec::new();
        for (name, job) in &self.jobs {
            if job.state() == JobState::Running || !job.is_due(now) {
                continue;
            }
            if self.trigger(name) == TriggerOutcome::Created {
                started.push(name.clone());
            }
        }
        started
    }

    /// Timer loop: call [`tick`](Self::tick) every `every` until shutdown.
    pub async fn run(&self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(every_secs = every.as_secs(), "Scheduler loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let started = self.tick();
                    if !started.is_empty() {
                        tracing::debug!(jobs = ?started, "Scheduled jobs triggered");
                    }
                }
            }
        }
        tracing::info!("Scheduler loop stopped");
    }

    /// Cancel all routines and wait until every launched run has returned.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        tracing::info!(in_flight = self.tracker.len(), "Draining running jobs");
        self.tracker.wait().await;
        tracing::info!("All background jobs stopped");
    }

    /// Replace the enabled flag and interval of a registered job.
    pub fn apply_schedule(&self, name: &str, config: ScheduleConfig) -> Result<()> {
        let job = self
            .jobs
            .get(name)
            .ok_or_else(|| SyncError::JobNotFound(name.to_string()))?;
        job.schedule().apply(config);
        tracing::info!(
            job = name,
            enabled = config.enabled,
            interval_secs = config.interval.as_secs(),
            "Job schedule updated"
        );
        Ok(())
    }

    pub fn job(&self, name: &str) -> Option<JobSnapshot> {
        self.jobs.get(name).map(|job| job.snapshot())
    }

    /// Snapshots of all jobs, sorted by name.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.jobs.values().map(|job| job.snapshot()).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of runs currently in progress.
    pub fn running_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state() == JobState::Running)
            .count()
    }
}
