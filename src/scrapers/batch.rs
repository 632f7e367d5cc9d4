//! Pull-based worker pool over a list of article ids.
//!
//! Workers share one [`FetchSession`] and one cursor. Each worker takes the
//! next unclaimed index, fetches it, records the outcome, and repeats until the
//! cursor passes the end of the input, so one slow article never holds up the
//! rest of a static partition.
//!
//! Successes land in a slot array sized to the input and indexed by position,
//! compacted once after the pool drains. Failures (errors and panics alike)
//! are caught per article and returned as [`FetchFailure`]s; they never abort
//! the batch.

use super::{ArticleFetcher, FetchSession};
use crate::error::{FetchError, PipelineError, Result};
use crate::models::{CanonicalItemId, FetchFailure, FetchedItem};
use futures::FutureExt;
use futures::future::join_all;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Result of one batch: partial success is the normal case.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Successful fetches. Treat as a multiset; order is not part of the contract.
    pub successes: Vec<FetchedItem>,
    pub failures: Vec<FetchFailure>,
}

/// Fetch every id in `ids` using up to `concurrency` concurrent workers.
///
/// The worker count is `min(concurrency, ids.len())`. An empty input returns
/// immediately without opening a session.
///
/// # Errors
///
/// - [`PipelineError::InvalidConcurrency`] when `concurrency` is 0.
/// - Whatever [`ArticleFetcher::open_session`] returns if the shared session
///   cannot be opened. Per-article failures are never errors.
#[instrument(level = "info", skip_all, fields(items = ids.len(), concurrency = concurrency))]
pub async fn run_batch<F>(fetcher: &F, ids: &[CanonicalItemId], concurrency: usize) -> Result<BatchOutcome>
where
    F: ArticleFetcher,
{
    if concurrency == 0 {
        return Err(PipelineError::InvalidConcurrency(concurrency));
    }
    if ids.is_empty() {
        return Ok(BatchOutcome::default());
    }

    let t0 = Instant::now();
    let worker_count = concurrency.min(ids.len());
    let session = fetcher.open_session().await?;

    let cursor = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<FetchedItem>>> = Mutex::new(vec![None; ids.len()]);
    let failures: Mutex<Vec<FetchFailure>> = Mutex::new(Vec::new());

    let workers = (0..worker_count).map(|worker| {
        let session = &session;
        let cursor = &cursor;
        let slots = &slots;
        let failures = &failures;
        async move {
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(id) = ids.get(index) else {
                    break;
                };
                let url = id.canonical_url();

                let outcome = AssertUnwindSafe(session.fetch_one(&url)).catch_unwind().await;
                match outcome {
                    Ok(Ok(item)) => {
                        debug!(worker, index, %url, "Fetched article");
                        lock(slots)[index] = Some(item);
                    }
                    Ok(Err(e)) => {
                        warn!(worker, index, %url, error = %e, "Article fetch failed");
                        lock(failures).push(FetchFailure {
                            url,
                            error_message: e.to_string(),
                        });
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(worker, index, %url, error = %message, "Article fetch panicked");
                        lock(failures).push(FetchFailure {
                            url,
                            error_message: message,
                        });
                    }
                }
            }
        }
    });
    join_all(workers).await;

    session.close().await;

    let successes: Vec<FetchedItem> = into_inner(slots).into_iter().flatten().collect();
    let failures = into_inner(failures);
    info!(
        workers = worker_count,
        succeeded = successes.len(),
        failed = failures.len(),
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "Batch finished"
    );
    Ok(BatchOutcome {
        successes,
        failures,
    })
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn into_inner<T>(m: Mutex<T>) -> T {
    m.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    };
    FetchError::Parse(detail).to_string()
}
