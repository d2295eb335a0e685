use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use access_sync::config::ScheduleConfig;
use access_sync::error::SyncError;
use access_sync::scheduler::{
    routine_fn, JobState, MetricsRegistry, NoopMetrics, Routine, Scheduler, TriggerOutcome,
};

// =============================================================================
// Helpers
// =============================================================================

/// Routine that counts its runs and blocks until `release` (or shutdown) fires.
fn gated_routine(release: CancellationToken, runs: Arc<AtomicUsize>) -> Arc<dyn Routine> {
    Arc::new(routine_fn(move |cancel: CancellationToken| {
        let release = release.clone();
        let runs = Arc::clone(&runs);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = release.cancelled() => {}
                _ = cancel.cancelled() => {}
            }
            Ok(())
        }
    }))
}

fn counting_routine(runs: Arc<AtomicUsize>) -> Arc<dyn Routine> {
    Arc::new(routine_fn(move |_| {
        let runs = Arc::clone(&runs);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }))
}

fn enabled(interval: Duration) -> ScheduleConfig {
    ScheduleConfig::new(true, interval)
}

async fn wait_until_idle(scheduler: &Scheduler, name: &str) {
    for _ in 0..500 {
        if scheduler.job(name).map(|j| j.state) == Some(JobState::Idle) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("job {} never returned to idle", name);
}

/// Value of one series in the rendered exposition text.
fn metric(metrics: &MetricsRegistry, series: &str) -> Option<f64> {
    metrics.render().lines().find_map(|line| {
        line.strip_prefix(series)?
            .strip_prefix(' ')?
            .trim()
            .parse()
            .ok()
    })
}

// =============================================================================
// Trigger
// =============================================================================

/// Test that concurrent triggers of one job start exactly one run.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_start_exactly_one_run() {
    let release = CancellationToken::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(CancellationToken::new(), Arc::new(NoopMetrics));
    scheduler
        .register(
            "capSvcToAad",
            gated_routine(release.clone(), runs.clone()),
            ScheduleConfig::default(),
        )
        .unwrap();
    let scheduler = Arc::new(scheduler);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let scheduler = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move { scheduler.trigger("capSvcToAad") }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            TriggerOutcome::Created => created += 1,
            TriggerOutcome::Conflict => conflicts += 1,
            TriggerOutcome::NotFound => panic!("job should be registered"),
        }
    }
    assert_eq!(created, 1, "Exactly one trigger should be accepted");
    assert_eq!(conflicts, 15);

    release.cancel();
    wait_until_idle(&scheduler, "capSvcToAad").await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Test that an unknown job name is NotFound and leaves registered jobs alone.
#[tokio::test]
async fn test_trigger_unknown_job_does_not_touch_state() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(CancellationToken::new(), Arc::new(NoopMetrics));
    scheduler
        .register("aadToAws", counting_routine(runs.clone()), ScheduleConfig::default())
        .unwrap();
    let before = scheduler.job("aadToAws").unwrap();

    assert_eq!(scheduler.trigger("awsmapping"), TriggerOutcome::NotFound);
    assert_eq!(scheduler.trigger(""), TriggerOutcome::NotFound);

    assert_eq!(scheduler.job("aadToAws").unwrap(), before);
    assert!(before.last_started_at.is_none());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

/// Test that a busy job rejects triggers until its run returns.
#[tokio::test]
async fn test_trigger_conflict_until_run_returns() {
    let release = CancellationToken::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(CancellationToken::new(), Arc::new(NoopMetrics));
    scheduler
        .register(
            "awsMapping",
            gated_routine(release.clone(), runs.clone()),
            ScheduleConfig::default(),
        )
        .unwrap();

    assert_eq!(scheduler.trigger("awsMapping"), TriggerOutcome::Created);
    assert_eq!(scheduler.job("awsMapping").unwrap().state, JobState::Running);
    assert_eq!(scheduler.trigger("awsMapping"), TriggerOutcome::Conflict);

    release.cancel();
    wait_until_idle(&scheduler, "awsMapping").await;
    assert_eq!(scheduler.trigger("awsMapping"), TriggerOutcome::Created);
    wait_until_idle(&scheduler, "awsMapping").await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Run outcomes
// =============================================================================

/// Test that a failing run returns to idle and is counted exactly once.
#[tokio::test]
async fn test_failed_run_returns_to_idle_and_counts_once() {
    let metrics = Arc::new(MetricsRegistry::default());
    let mut scheduler = Scheduler::new(CancellationToken::new(), metrics.clone());
    scheduler
        .register(
            "costCentreToFinout",
            Arc::new(routine_fn(|_| async {
                Err::<(), _>(SyncError::Internal("tag service unavailable".to_string()))
            })),
            ScheduleConfig::default(),
        )
        .unwrap();

    assert_eq!(scheduler.trigger("costCentreToFinout"), TriggerOutcome::Created);
    wait_until_idle(&scheduler, "costCentreToFinout").await;

    let job = scheduler.job("costCentreToFinout").unwrap();
    assert_eq!(job.failure_count, 1);
    assert_eq!(job.success_count, 0);

    assert_eq!(metric(&metrics, "access_sync_job_failed_count{name=\"costCentreToFinout\"}"), Some(1.0));
    assert_eq!(metric(&metrics, "access_sync_job_is_running{name=\"costCentreToFinout\"}"), Some(0.0));
    assert_eq!(metric(&metrics, "access_sync_jobs_running"), Some(0.0));

    // Still eligible for the next trigger.
    assert_eq!(scheduler.trigger("costCentreToFinout"), TriggerOutcome::Created);
    wait_until_idle(&scheduler, "costCentreToFinout").await;
    assert_eq!(scheduler.job("costCentreToFinout").unwrap().failure_count, 2);
}

/// Test that a panicking routine still releases its job.
#[tokio::test]
async fn test_panicking_routine_returns_to_idle() {
    let metrics = Arc::new(MetricsRegistry::default());
    let mut scheduler = Scheduler::new(CancellationToken::new(), metrics.clone());
    scheduler
        .register(
            "aadToAws",
            Arc::new(routine_fn(|_| async {
                if true {
                    panic!("directory client exploded");
                }
                Ok(())
            })),
            ScheduleConfig::default(),
        )
        .unwrap();

    assert_eq!(scheduler.trigger("aadToAws"), TriggerOutcome::Created);
    wait_until_idle(&scheduler, "aadToAws").await;

    assert_eq!(scheduler.job("aadToAws").unwrap().failure_count, 1);
    assert_eq!(metric(&metrics, "access_sync_jobs_running"), Some(0.0));
    assert_eq!(scheduler.trigger("aadToAws"), TriggerOutcome::Created);
}

/// Test that a run ended by cancellation is not a failure.
#[tokio::test]
async fn test_cancelled_run_is_not_a_failure() {
    let token = CancellationToken::new();
    let mut scheduler = Scheduler::new(token.clone(), Arc::new(NoopMetrics));
    scheduler
        .register(
            "capSvcToAad",
            Arc::new(routine_fn(|cancel: CancellationToken| async move {
                cancel.cancelled().await;
                Ok(())
            })),
            ScheduleConfig::default(),
        )
        .unwrap();

    assert_eq!(scheduler.trigger("capSvcToAad"), TriggerOutcome::Created);
    token.cancel();
    wait_until_idle(&scheduler, "capSvcToAad").await;

    let job = scheduler.job("capSvcToAad").unwrap();
    assert_eq!(job.failure_count, 0);
    assert_eq!(job.success_count, 1);
}

/// Test that a routine giving up with a cancellation error, e.g. while backing
/// off a rate limit, is counted as cancelled rather than failed.
#[tokio::test]
async fn test_cancellation_error_is_not_a_failure() {
    let token = CancellationToken::new();
    let metrics = Arc::new(MetricsRegistry::default());
    let mut scheduler = Scheduler::new(token.clone(), metrics.clone());
    scheduler
        .register(
            "awsMapping",
            Arc::new(routine_fn(|cancel: CancellationToken| async move {
                cancel.cancelled().await;
                Err::<(), _>(SyncError::Cancelled)
            })),
            ScheduleConfig::default(),
        )
        .unwrap();

    assert_eq!(scheduler.trigger("awsMapping"), TriggerOutcome::Created);
    token.cancel();
    wait_until_idle(&scheduler, "awsMapping").await;

    let job = scheduler.job("awsMapping").unwrap();
    assert_eq!(job.failure_count, 0);
    assert_eq!(job.success_count, 1);
    assert_eq!(metric(&metrics, "access_sync_job_failed_count{name=\"awsMapping\"}"), Some(0.0));
}

/// Test that the metrics registry sees the running gauge rise and fall.
#[tokio::test]
async fn test_metrics_follow_run_lifecycle() {
    let release = CancellationToken::new();
    let metrics = Arc::new(MetricsRegistry::default());
    let mut scheduler = Scheduler::new(CancellationToken::new(), metrics.clone());
    for name in ["capSvcToAad", "awsMapping"] {
        scheduler
            .register(
                name,
                gated_routine(release.clone(), Arc::new(AtomicUsize::new(0))),
                ScheduleConfig::default(),
            )
            .unwrap();
    }

    scheduler.trigger("capSvcToAad");
    scheduler.trigger("awsMapping");
    assert_eq!(metric(&metrics, "access_sync_jobs_running"), Some(2.0));
    assert_eq!(scheduler.running_count(), 2);
    assert_eq!(metric(&metrics, "access_sync_job_is_running{name=\"awsMapping\"}"), Some(1.0));

    release.cancel();
    wait_until_idle(&scheduler, "capSvcToAad").await;
    wait_until_idle(&scheduler, "awsMapping").await;

    assert_eq!(metric(&metrics, "access_sync_jobs_running"), Some(0.0));
    assert_eq!(metric(&metrics, "access_sync_job_success_count{name=\"awsMapping\"}"), Some(1.0));
    assert_eq!(metric(&metrics, "access_sync_job_success_count{name=\"capSvcToAad\"}"), Some(1.0));
}

// =============================================================================
// Tick and timer loop
// =============================================================================

/// Test that tick starts enabled jobs that are due and nothing else.
#[tokio::test(start_paused = true)]
async fn test_tick_starts_only_due_jobs() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(CancellationToken::new(), Arc::new(NoopMetrics));
    scheduler
        .register("awsMapping", counting_routine(runs.clone()), enabled(Duration::from_secs(60)))
        .unwrap();
    scheduler
        .register("aadToAws", counting_routine(runs.clone()), ScheduleConfig::default())
        .unwrap();

    // A newly registered, enabled job is immediately eligible.
    assert_eq!(scheduler.tick(), vec!["awsMapping".to_string()]);
    wait_until_idle(&scheduler, "awsMapping").await;

    assert!(scheduler.tick().is_empty(), "Interval has not elapsed");

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(scheduler.tick(), vec!["awsMapping".to_string()]);
    wait_until_idle(&scheduler, "awsMapping").await;

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.job("aadToAws").unwrap().success_count, 0);
}

/// Test that tick skips a job that is still running instead of waiting.
#[tokio::test(start_paused = true)]
async fn test_tick_skips_running_job() {
    let release = CancellationToken::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(CancellationToken::new(), Arc::new(NoopMetrics));
    scheduler
        .register(
            "capSvcToAad",
            gated_routine(release.clone(), runs.clone()),
            enabled(Duration::from_secs(10)),
        )
        .unwrap();

    assert_eq!(scheduler.tick().len(), 1);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(scheduler.tick().is_empty());
    assert_eq!(scheduler.job("capSvcToAad").unwrap().state, JobState::Running);

    release.cancel();
    wait_until_idle(&scheduler, "capSvcToAad").await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Test that the timer loop re-runs a job once its interval has elapsed.
#[tokio::test(start_paused = true)]
async fn test_run_loop_triggers_on_interval() {
    let token = CancellationToken::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(token.clone(), Arc::new(NoopMetrics));
    scheduler
        .register(
            "costCentreToFinout",
            counting_routine(runs.clone()),
            enabled(Duration::from_secs(3600)),
        )
        .unwrap();
    let scheduler = Arc::new(scheduler);

    let loop_handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(Duration::from_secs(60)).await })
    };

    tokio::time::sleep(Duration::from_secs(1800)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "First tick runs the job");

    tokio::time::sleep(Duration::from_secs(1830)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2, "Second run after one interval");

    token.cancel();
    loop_handle.await.unwrap();
}

/// Test that a schedule reload can enable a job at runtime.
#[tokio::test(start_paused = true)]
async fn test_apply_schedule_enables_job() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(CancellationToken::new(), Arc::new(NoopMetrics));
    scheduler
        .register("aadToAws", counting_routine(runs.clone()), ScheduleConfig::default())
        .unwrap();

    assert!(scheduler.tick().is_empty());
    scheduler
        .apply_schedule("aadToAws", enabled(Duration::from_secs(300)))
        .unwrap();

    let job = scheduler.job("aadToAws").unwrap();
    assert!(job.enabled);
    assert_eq!(job.interval_secs, 300);
    assert_eq!(scheduler.tick(), vec!["aadToAws".to_string()]);
    wait_until_idle(&scheduler, "aadToAws").await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Test that job snapshots are listed by name.
#[test]
fn test_jobs_are_listed_by_name() {
    let mut scheduler = Scheduler::new(CancellationToken::new(), Arc::new(NoopMetrics));
    for name in ["costCentreToFinout", "aadToAws", "capSvcToAad"] {
        scheduler
            .register(
                name,
                counting_routine(Arc::new(AtomicUsize::new(0))),
                ScheduleConfig::default(),
            )
            .unwrap();
    }

    let names: Vec<String> = scheduler.jobs().into_iter().map(|j| j.name).collect();
    assert_eq!(names, vec!["aadToAws", "capSvcToAad", "costCentreToFinout"]);
    assert!(scheduler.jobs().iter().all(|j| j.state == JobState::Idle));
}
