use std::collections::BTreeSet;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use access_sync::error::{SyncError, UpstreamError, UpstreamErrorKind};
use access_sync::reconcile::{apply, fold_key, ApplyReport, ReconciliationPlan};

type Plan = ReconciliationPlan<String, String, String>;

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn plan(desired: &BTreeSet<String>, target: &Mutex<BTreeSet<String>>) -> Plan {
    let actual = target.lock().unwrap().clone();
    ReconciliationPlan::diff(desired.iter().cloned(), actual, |d| fold_key(d), |a| fold_key(a))
}

/// Apply `plan` to an in-memory target set.
async fn apply_to(
    plan: Plan,
    target: &Mutex<BTreeSet<String>>,
    cancel: &CancellationToken,
) -> Result<ApplyReport, SyncError> {
    apply(
        "test",
        plan,
        cancel,
        |_, entry: String| async move {
            target.lock().unwrap().insert(entry);
            Ok(())
        },
        |_, entry: String| async move {
            target.lock().unwrap().remove(&entry);
            Ok(())
        },
    )
    .await
}

/// Test the canonical example: {A, B, C} against {B, C, D}.
#[test]
fn test_plan_adds_missing_and_removes_stale() {
    let plan: Plan = ReconciliationPlan::diff(
        ["A", "B", "C"].map(String::from),
        ["B", "C", "D"].map(String::from),
        |d| d.clone(),
        |a| a.clone(),
    );

    assert_eq!(plan.additions.keys().cloned().collect::<Vec<_>>(), vec!["A"]);
    assert_eq!(plan.removals.keys().cloned().collect::<Vec<_>>(), vec!["D"]);
}

/// Test that re-planning against an applied target yields an empty plan.
#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let desired = set(&["alice@example.com", "bob@example.com", "carol@example.com"]);
    let target = Mutex::new(set(&["bob@example.com", "dave@example.com"]));
    let cancel = CancellationToken::new();

    let first = plan(&desired, &target);
    assert_eq!(first.additions.len(), 2);
    assert_eq!(first.removals.len(), 1);

    let report = apply_to(first, &target, &cancel).await.unwrap();
    assert_eq!(report.added, 2);
    assert_eq!(report.removed, 1);
    assert!(!report.cancelled);

    assert!(plan(&desired, &target).is_empty());
    assert_eq!(*target.lock().unwrap(), desired);
}

/// Test that principal names differing only in case are the same entry.
#[test]
fn test_case_insensitive_keys_match() {
    let desired = set(&["Alice@Example.COM"]);
    let target = Mutex::new(set(&["alice@example.com"]));
    assert!(plan(&desired, &target).is_empty());
}

/// Test that cancelling after 3 of 5 additions returns cleanly and the next
/// plan covers only the remaining 2.
#[tokio::test]
async fn test_cancel_mid_apply_leaves_remainder_for_next_run() {
    let desired = set(&["a", "b", "c", "d", "e"]);
    let target = Mutex::new(BTreeSet::new());
    let cancel = CancellationToken::new();

    let first = plan(&desired, &target);
    assert_eq!(first.additions.len(), 5);

    let report = apply(
        "test",
        first,
        &cancel,
        |_, entry: String| {
            let target = &target;
            let cancel = &cancel;
            async move {
                let mut applied = target.lock().unwrap();
                applied.insert(entry);
                if applied.len() == 3 {
                    cancel.cancel();
                }
                Ok(())
            }
        },
        |_, _: String| async { Ok(()) },
    )
    .await
    .expect("Cancellation is not an error");

    assert!(report.cancelled);
    assert_eq!(report.added, 3);

    let next = plan(&desired, &target);
    assert_eq!(next.additions.len(), 2);
    assert!(next.removals.is_empty());
}

/// Test that soft per-item errors are skipped and the pass continues.
#[tokio::test]
async fn test_soft_errors_are_skipped() {
    let desired = set(&["alice", "ghost", "zed"]);
    let target = Mutex::new(BTreeSet::new());
    let cancel = CancellationToken::new();

    let report = apply(
        "test",
        plan(&desired, &target),
        &cancel,
        |_, entry: String| {
            let target = &target;
            async move {
                if entry == "ghost" {
                    return Err(UpstreamError::not_found("directory", "user not found"));
                }
                target.lock().unwrap().insert(entry);
                Ok(())
            }
        },
        |_, _: String| async { Ok(()) },
    )
    .await
    .unwrap();

    assert_eq!(report.added, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(*target.lock().unwrap(), set(&["alice", "zed"]));
}

/// Test that a hard error aborts the rest of the plan and is propagated.
#[tokio::test]
async fn test_hard_error_aborts_plan() {
    let desired = set(&["a", "b", "c"]);
    let target = Mutex::new(BTreeSet::new());
    let cancel = CancellationToken::new();

    let result = apply(
        "test",
        plan(&desired, &target),
        &cancel,
        |_, entry: String| {
            let target = &target;
            async move {
                if entry == "b" {
                    return Err(UpstreamError::new(
                        "directory",
                        UpstreamErrorKind::Status(500),
                        "internal error",
                    ));
                }
                target.lock().unwrap().insert(entry);
                Ok(())
            }
        },
        |_, _: String| async { Ok(()) },
    )
    .await;

    match result {
        Err(SyncError::Upstream(e)) => assert_eq!(e.kind, UpstreamErrorKind::Status(500)),
        other => panic!("expected upstream error, got {:?}", other),
    }
    assert_eq!(*target.lock().unwrap(), set(&["a"]));
}

/// Test that an already-cancelled pass applies nothing.
#[tokio::test]
async fn test_cancelled_before_start_applies_nothing() {
    let desired = set(&["a"]);
    let target = Mutex::new(set(&["b"]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = apply_to(plan(&desired, &target), &target, &cancel)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.added + report.removed, 0);
    assert_eq!(*target.lock().unwrap(), set(&["b"]));
}
