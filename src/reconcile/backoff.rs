use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError, UpstreamError};

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation token for the next page, `None` on the last page.
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// Exponential backoff for rate-limited listings.
///
/// A rate-limited call is retried after `initial_delay`, then after twice
/// that, and so on, until `max_attempts` calls have been made. Any other
/// error is returned at once.
///
/// Cancellation is checked before every call and interrupts a pending sleep;
/// either way the caller gets [`SyncError::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max_attempts: u32,
    initial_delay: Duration,
}

struct Attempts {
    made: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn attempts(&self) -> Attempts {
        Attempts {
            made: 0,
            delay: self.initial_delay,
        }
    }

    /// Decide what to do with a failed call. Returns the error when the
    /// caller must give up, after sleeping otherwise.
    async fn on_error(
        &self,
        state: &mut Attempts,
        err: UpstreamError,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !err.is_rate_limited() {
            return Err(err.into());
        }
        state.made += 1;
        if state.made >= self.max_attempts {
            tracing::warn!(
                attempts = state.made,
                error = %err,
                "Rate limit retries exhausted"
            );
            return Err(err.into());
        }

        tracing::debug!(
            backoff_limit = self.max_attempts,
            backoff_counter = state.made,
            delay_ms = state.delay.as_millis() as u64,
            "Exponential backoff triggered"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Backoff interrupted by cancellation");
                return Err(SyncError::Cancelled);
            }
            _ = tokio::time::sleep(state.delay) => {}
        }
        state.delay = state.delay.saturating_mul(2);
        Ok(())
    }

    /// Run a single call with retries.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let mut state = self.attempts();
        loop {
            ensure_live(cancel)?;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => self.on_error(&mut state, e, cancel).await?,
            }
        }
    }

    /// Drain a paginated listing. The attempt budget is shared by all pages
    /// of this listing.
    pub async fn collect_pages<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut fetch: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = std::result::Result<Page<T>, UpstreamError>>,
    {
        let mut state = self.attempts();
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            ensure_live(cancel)?;
            match fetch(token.clone()).await {
                Ok(page) => {
                    items.extend(page.items);
                    match page.next {
                        Some(next) => token = Some(next),
                        None => return Ok(items),
                    }
                }
                Err(e) => self.on_error(&mut state, e, cancel).await?,
            }
        }
    }

    /// Walk a tree whose children are listed page by page, e.g. nested
    /// organizational units. Returns every descendant of `root`, not `root`
    /// itself. Each parent's listing gets a fresh attempt budget.
    pub async fn collect_tree<N, F, Fut, I>(
        &self,
        cancel: &CancellationToken,
        root: String,
        mut fetch_children: F,
        node_id: I,
    ) -> Result<Vec<N>>
    where
        F: FnMut(String, Option<String>) -> Fut,
        Fut: Future<Output = std::result::Result<Page<N>, UpstreamError>>,
        I: Fn(&N) -> String,
    {
        let mut found = Vec::new();
        let mut pending = vec![root];
        while let Some(parent) = pending.pop() {
            let children = self
                .collect_pages(cancel, |token| fetch_children(parent.clone(), token))
                .await?;
            pending.extend(children.iter().map(&node_id));
            found.extend(children);
        }
        Ok(found)
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}
