//! Generic convergence of a target system toward a desired state.
//!
//! Every reconciliation routine follows the same shape: read the desired set
//! from a source system, read the actual set from the target, [`diff`] them
//! into a [`ReconciliationPlan`] and [`apply`] the plan through mutation
//! callbacks. Rate-limited listings go through [`Backoff`]; bulk read-only
//! lookups may use [`fan_out`].
//!
//! [`diff`]: ReconciliationPlan::diff

pub mod backoff;
pub mod fanout;
pub mod plan;

pub use backoff::{Backoff, Page};
pub use fanout::{fan_out, DEFAULT_FAN_OUT_LIMIT};
pub use plan::{apply, fold_key, ApplyReport, ReconciliationPlan};
