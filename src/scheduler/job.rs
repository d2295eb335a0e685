use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::scheduler::metrics::RunOutcome;

/// A reconciliation routine.
///
/// Routines receive only the process-wide cancellation signal. A cancelled run
/// should return `Ok(())`; only genuine failures are reported as errors.
#[async_trait]
pub trait Routine: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

/// Adapter that turns an async closure into a [`Routine`].
pub struct FnRoutine<F>(F);

pub fn routine_fn<F, Fut>(f: F) -> FnRoutine<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnRoutine(f)
}

#[async_trait]
impl<F, Fut> Routine for FnRoutine<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        (self.0)(cancel).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Running => write!(f, "running"),
        }
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

/// Run flag of a job. `Idle -> Running` is a single compare-and-swap.
#[derive(Debug)]
pub struct RunState(AtomicU8);

impl Default for RunState {
    fn default() -> Self {
        Self(AtomicU8::new(IDLE))
    }
}

impl RunState {
    /// Move to `Running`. Returns false if a run is already in progress.
    pub fn try_start(&self) -> bool {
        self.0
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self) {
        self.0.store(IDLE, Ordering::Release);
    }

    pub fn get(&self) -> JobState {
        match self.0.load(Ordering::Acquire) {
            RUNNING => JobState::Running,
            _ => JobState::Idle,
        }
    }
}

/// When a job may run next.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub enabled: bool,
    pub interval: Duration,
    /// Monotonic start of the last run. `None` means the job has never run in
    /// this process and is immediately eligible.
    pub last_executed: Option<Instant>,
    pub last_started_at: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval,
            last_executed: None,
            last_started_at: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_executed {
            Some(last) => now >= last + self.interval,
            None => true,
        }
    }

    pub fn mark_started(&mut self, now: Instant) {
        self.last_executed = Some(now);
        self.last_started_at = Some(Utc::now());
    }

    /// Replace enabled flag and interval, keeping the last execution time.
    pub fn apply(&mut self, config: ScheduleConfig) {
        self.enabled = config.enabled;
        self.interval = config.interval;
    }
}

/// A named, independently schedulable reconciliation unit.
pub struct Job {
    name: String,
    routine: Arc<dyn Routine>,
    state: RunState,
    schedule: Mutex<Schedule>,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("schedule", &*self.schedule())
            .finish()
    }
}

impl Job {
    pub fn new(name: impl Into<String>, routine: Arc<dyn Routine>, config: ScheduleConfig) -> Self {
        Self {
            name: name.into(),
            routine,
            state: RunState::default(),
            schedule: Mutex::new(Schedule::new(config)),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routine(&self) -> Arc<dyn Routine> {
        Arc::clone(&self.routine)
    }

    pub fn state(&self) -> JobState {
        self.state.get()
    }

    pub fn run_state(&self) -> &RunState {
        &self.state
    }

    pub fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.schedule().is_due(now)
    }

    pub fn record(&self, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
            RunOutcome::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let schedule = self.schedule();
        JobSnapshot {
            name: self.name.clone(),
            state: self.state.get(),
            enabled: schedule.enabled,
            interval_secs: schedule.interval.as_secs(),
            last_started_at: schedule.last_started_at,
            success_count: self.succeeded.load(Ordering::Relaxed),
            failure_count: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a job, safe to hand out to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub state: JobState,
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
}
