//! Job run metrics.
//!
//! The scheduler reports every run start and end to a [`MetricsRecorder`]
//! handed to it at construction time. [`MetricsRegistry`] records them through a
//! Prometheus recorder and renders the text exposition format:
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `<ns>_jobs_running` | Gauge | - |
//! | `<ns>_job_is_running` | Gauge | `name` |
//! | `<ns>_job_failed_count` | Counter | `name` |
//! | `<ns>_job_success_count` | Counter | `name` |

use metrics::{counter, describe_counter, describe_gauge, gauge, with_local_recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// Default metric namespace.
pub const NAMESPACE: &str = "access_sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

/// Sink for job lifecycle metrics. Must be callable from many runs at once.
pub trait MetricsRecorder: Send + Sync {
    /// A job was added to the scheduler.
    fn job_registered(&self, _job: &str) {}

    fn job_started(&self, job: &str);

    fn job_finished(&self, job: &str, outcome: RunOutcome);
}

/// Recorder that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn job_started(&self, _job: &str) {}

    fn job_finished(&self, _job: &str, _outcome: RunOutcome) {}
}

/// Prometheus registry owned by the scheduler's caller.
///
/// The recorder is never installed globally, so several registries (one per
/// test, say) can live in the same process.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    jobs_running: String,
    job_is_running: String,
    job_failed_count: String,
    job_success_count: String,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(NAMESPACE)
    }
}

impl MetricsRegistry {
    pub fn new(namespace: &str) -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let registry = Self {
            recorder,
            handle,
            jobs_running: format!("{namespace}_jobs_running"),
            job_is_running: format!("{namespace}_job_is_running"),
            job_failed_count: format!("{namespace}_job_failed_count"),
            job_success_count: format!("{namespace}_job_success_count"),
        };

        registry.record(|| {
            describe_gauge!(registry.jobs_running.clone(), "Current jobs that are running");
            describe_gauge!(
                registry.job_is_running.clone(),
                "Is {job_name} running. 1 = in progress, 0 = not running"
            );
            describe_counter!(
                registry.job_failed_count.clone(),
                "How many times has {job_name} failed."
            );
            describe_counter!(
                registry.job_success_count.clone(),
                "How many times has {job_name} successfully completed."
            );
            gauge!(registry.jobs_running.clone()).set(0.0);
        });
        registry
    }

    fn record<T>(&self, f: impl FnOnce() -> T) -> T {
        with_local_recorder(&self.recorder, f)
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl MetricsRecorder for MetricsRegistry {
    fn job_registered(&self, job: &str) {
        self.record(|| {
            gauge!(self.job_is_running.clone(), "name" => job.to_string()).set(0.0);
            counter!(self.job_failed_count.clone(), "name" => job.to_string()).absolute(0);
            counter!(self.job_success_count.clone(), "name" => job.to_string()).absolute(0);
        });
    }

    fn job_started(&self, job: &str) {
        self.record(|| {
            gauge!(self.jobs_running.clone()).increment(1.0);
            gauge!(self.job_is_running.clone(), "name" => job.to_string()).set(1.0);
        });
    }

    fn job_finished(&self, job: &str, outcome: RunOutcome) {
        let outcome_count = match outcome {
            RunOutcome::Succeeded => &self.job_success_count,
            RunOutcome::Failed => &self.job_failed_count,
        };
        self.record(|| {
            gauge!(self.jobs_running.clone()).decrement(1.0);
            gauge!(self.job_is_running.clone(), "name" => job.to_string()).set(0.0);
            counter!(outcome_count.clone(), "name" => job.to_string()).increment(1);
        });
    }
}
