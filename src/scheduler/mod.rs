//! Job orchestration.
//!
//! - [`Scheduler`]: job registry, timer-driven and on-demand triggering, drain on shutdown
//! - [`Job`]: a named routine with its [`Schedule`] and run flag
//! - [`metrics`]: run counters and gauges
//!
//! # Lifecycle
//!
//! A job is `Idle` until a trigger is accepted, `Running` while its routine
//! executes, and returns to `Idle` when the routine returns, fails or panics.
//! A trigger that arrives while the job is `Running` is rejected with
//! [`TriggerOutcome::Conflict`].

pub mod job;
pub mod metrics;
pub mod orchestrator;

pub use job::{routine_fn, Job, JobSnapshot, JobState, Routine, Schedule};
pub use metrics::{MetricsRecorder, MetricsRegistry, NoopMetrics, RunOutcome};
pub use orchestrator::{Scheduler, TriggerOutcome};
