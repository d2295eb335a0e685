use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default ceiling for concurrent read-only lookups.
pub const DEFAULT_FAN_OUT_LIMIT: usize = 30;

/// Run `lookup` for every item with at most `limit` calls in flight.
///
/// Only for read-only queries: results come back in completion order, and an
/// item whose lookup fails (or panics) is logged and left out of the result.
pub async fn fan_out<T, R, E, F, Fut>(items: Vec<T>, limit: usize, lookup: F) -> Vec<R>
where
    T: Display + Clone + Send + 'static,
    R: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let lookup = Arc::new(lookup);
    let mut join_set = JoinSet::new();

    for item in items {
        let semaphore = Arc::clone(&semaphore);
        let lookup = Arc::clone(&lookup);
        join_set.spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await.ok();
            let label = item.to_string();
            (label, lookup(item).await)
        });
    }

    let mut results = Vec::with_capacity(join_set.len());
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((_, Ok(value))) => results.push(value),
            Ok((item, Err(e))) => {
                tracing::warn!(item = %item, error = %e, "Lookup failed, skipping");
            }
            Err(e) => {
                tracing::error!(error = %e, "Lookup task panicked");
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn fan_out_skips_failures() {
        let mut doubled = fan_out(vec![1u32, 2, 3, 4], 2, |n| async move {
            if n == 3 {
                Err(UpstreamError::not_found("sso", "gone"))
            } else {
                Ok(n * 2)
            }
        })
        .await;
        doubled.sort();
        assert_eq!(doubled, vec![2, 4, 8]);
    }

    #[tokio::test]
    async fn fan_out_respects_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let results = fan_out((0..20u32).collect(), 3, move |_| {
            let (f, p) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, UpstreamError>(())
            }
        })
        .await;

        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
