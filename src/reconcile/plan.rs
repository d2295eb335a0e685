use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, UpstreamError};

/// Normalise an identifier from a case-insensitive system (emails, UPNs).
pub fn fold_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Additions and removals that move an actual set toward a desired set.
///
/// `additions` holds desired entries whose key is absent from the actual set;
/// `removals` holds actual entries whose key is absent from the desired set.
/// Entries present on both sides are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan<K: Ord, D, A> {
    pub additions: BTreeMap<K, D>,
    pub removals: BTreeMap<K, A>,
}

impl<K: Ord, D, A> Default for ReconciliationPlan<K, D, A> {
    fn default() -> Self {
        Self {
            additions: BTreeMap::new(),
            removals: BTreeMap::new(),
        }
    }
}

impl<K: Ord, D, A> ReconciliationPlan<K, D, A> {
    /// Diff `desired` against `actual`, keyed by the given extractors. When a
    /// side contains the same key twice the first entry wins.
    pub fn diff<DI, AI, FD, FA>(desired: DI, actual: AI, desired_key: FD, actual_key: FA) -> Self
    where
        DI: IntoIterator<Item = D>,
        AI: IntoIterator<Item = A>,
        FD: Fn(&D) -> K,
        FA: Fn(&A) -> K,
    {
        let mut wanted: BTreeMap<K, D> = BTreeMap::new();
        for entry in desired {
            wanted.entry(desired_key(&entry)).or_insert(entry);
        }

        let mut present: BTreeMap<K, A> = BTreeMap::new();
        for entry in actual {
            present.entry(actual_key(&entry)).or_insert(entry);
        }

        let mut removals: BTreeMap<K, A> = BTreeMap::new();
        for (key, entry) in present {
            if wanted.remove(&key).is_none() {
                removals.insert(key, entry);
            }
        }

        // Whatever is still wanted has no counterpart in the actual set.
        Self {
            additions: wanted,
            removals,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.additions.len() + self.removals.len()
    }
}

/// What an [`apply`] pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub added: usize,
    pub removed: usize,
    /// Mutations that failed with a soft error and were skipped.
    pub skipped: usize,
    /// The pass stopped early because cancellation was requested.
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.added += other.added;
        self.removed += other.removed;
        self.skipped += other.skipped;
        self.cancelled |= other.cancelled;
    }
}

/// Apply `plan` to a target through the supplied mutations.
///
/// Mutations run one at a time: additions first, then removals. Cancellation
/// is checked before every item; a cancelled pass returns `Ok` with
/// `cancelled` set and leaves the rest of the plan for the next run. Soft
/// upstream errors are logged and skipped, any other error aborts the pass.
pub async fn apply<K, D, A, FAdd, AddFut, FRemove, RemoveFut>(
    scope: &str,
    plan: ReconciliationPlan<K, D, A>,
    cancel: &CancellationToken,
    mut add: FAdd,
    mut remove: FRemove,
) -> Result<ApplyReport>
where
    K: Ord + Clone + Display,
    FAdd: FnMut(K, D) -> AddFut,
    AddFut: Future<Output = std::result::Result<(), UpstreamError>>,
    FRemove: FnMut(K, A) -> RemoveFut,
    RemoveFut: Future<Output = std::result::Result<(), UpstreamError>>,
{
    let mut report = ApplyReport::default();
    if plan.is_empty() {
        tracing::debug!(scope, "Nothing to reconcile");
        return Ok(report);
    }

    tracing::info!(
        scope,
        additions = plan.additions.len(),
        removals = plan.removals.len(),
        "Applying reconciliation plan"
    );

    for (key, entry) in plan.additions {
        if cancel.is_cancelled() {
            tracing::info!(scope, "Reconciliation cancelled");
            report.cancelled = true;
            return Ok(report);
        }

        tracing::debug!(scope, key = %key, "Adding entry");
        match add(key.clone(), entry).await {
            Ok(()) => report.added += 1,
            Err(e) if e.is_soft() => {
                tracing::info!(scope, key = %key, error = %e, "Skipping entry");
                report.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for (key, entry) in plan.removals {
        if cancel.is_cancelled() {
            tracing::info!(scope, "Reconciliation cancelled");
            report.cancelled = true;
            return Ok(report);
        }

        tracing::debug!(scope, key = %key, "Removing stale entry");
        match remove(key.clone(), entry).await {
            Ok(()) => report.removed += 1,
            Err(e) if e.is_soft() => {
                tracing::info!(scope, key = %key, error = %e, "Skipping entry");
                report.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(report)
}
