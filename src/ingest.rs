//! Ingestion state machine.
//!
//! Each stored article moves through
//!
//! ```text
//! PENDING --try_claim--> PROCESSING --finalize(Done)---> DONE
//!                                   --finalize(Failed)-> FAILED --reset_failed--> PENDING
//! ```
//!
//! A lost claim race leaves the record PENDING and returns `false`. Re-collecting
//! an article refreshes its content, bumps `version`, and leaves `status`
//! alone, so a re-scrape never pulls a DONE or FAILED record back to PENDING.
//! That last rule is a product choice: re-analysis of changed articles goes
//! through the explicit retry path instead.

use crate::error::{PipelineError, Result};
use crate::models::{
    CanonicalItemId, ClaimableRecord, FetchedItem, IngestedRecord, RecordSource, RecordStatus,
};
use crate::store::{RecordStore, UpsertAction};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Per-record result of [`upsert_batch`].
#[derive(Debug)]
pub struct UpsertEntry {
    pub url: String,
    /// `None` when the URL could not be turned into an id.
    pub id: Option<String>,
    pub result: Result<UpsertAction>,
}

/// Outcome of one upsert batch, one entry per input item, in input order.
#[derive(Debug, Default)]
pub struct UpsertReport {
    pub entries: Vec<UpsertEntry>,
}

impl UpsertReport {
    pub fn inserted(&self) -> usize {
        self.count(|r| matches!(r, Ok(UpsertAction::Inserted)))
    }

    pub fn refreshed(&self) -> usize {
        self.count(|r| matches!(r, Ok(UpsertAction::Refreshed { .. })))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| r.is_err())
    }

    fn count(&self, f: impl Fn(&Result<UpsertAction>) -> bool) -> usize {
        self.entries.iter().filter(|e| f(&e.result)).count()
    }
}

/// Terminal outcome of one analysis attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
}

impl From<Outcome> for RecordStatus {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Done => RecordStatus::Done,
            Outcome::Failed => RecordStatus::Failed,
        }
    }
}

/// Build the row to store for `item`, given what is already stored under `id`.
pub fn merge_record(
    existing: Option<&IngestedRecord>,
    id: &str,
    item: &FetchedItem,
    source: RecordSource,
    now: DateTime<Utc>,
) -> IngestedRecord {
    match existing {
        None => IngestedRecord {
            id: id.to_string(),
            url: item.url.clone(),
            title: item.title.clone(),
            body: item.body.clone(),
            published_at: item.published_at.clone(),
            collected_at: now,
            last_seen_at: now,
            source,
            status: RecordStatus::Pending,
            version: 1,
            status_changed_at: now,
        },
        Some(prev) => IngestedRecord {
            id: prev.id.clone(),
            url: item.url.clone(),
            title: item.title.clone(),
            body: item.body.clone(),
            published_at: item.published_at.clone(),
            collected_at: prev.collected_at,
            last_seen_at: now,
            source: prev.source,
            status: prev.status,
            version: prev.version + 1,
            status_changed_at: prev.status_changed_at,
        },
    }
}

/// Persist a batch of fetched articles, one independent write per article.
///
/// Items whose URL has no canonical id, and items whose write fails, are
/// reported per entry; they do not stop the remaining writes.
#[instrument(level = "info", skip_all, fields(items = items.len(), source = source.as_str()))]
pub async fn upsert_batch(store: &dyn RecordStore, items: &[FetchedItem], source: RecordSource) -> UpsertReport {
    let now = Utc::now();
    let mut report = UpsertReport::default();

    for item in items {
        let id = match CanonicalItemId::from_article_url(&item.url) {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!(url = %item.url, error = %e, "Skipping item without canonical id");
                report.entries.push(UpsertEntry {
                    url: item.url.clone(),
                    id: None,
                    result: Err(e),
                });
                continue;
            }
        };

        let result = store.upsert(&id, item, source, now).await;
        match &result {
            Ok(action) => debug!(%id, ?action, "Upserted record"),
            Err(e) => warn!(%id, error = %e, "Upsert failed"),
        }
        report.entries.push(UpsertEntry {
            url: item.url.clone(),
            id: Some(id),
            result,
        });
    }

    info!(
        inserted = report.inserted(),
        refreshed = report.refreshed(),
        failed = report.failed(),
        "Upsert batch finished"
    );
    report
}

/// Up to `limit` PENDING records, oldest-collected first.
pub async fn claim_pending(store: &dyn RecordStore, limit: usize) -> Result<Vec<ClaimableRecord>> {
    store.pending(limit).await
}

/// Atomically move `id` from PENDING to PROCESSING.
///
/// `false` means someone else claimed it first (or it was not PENDING).
pub async fn try_claim(store: &dyn RecordStore, id: &str) -> Result<bool> {
    store
        .compare_and_set_status(id, RecordStatus::Pending, RecordStatus::Processing, Utc::now())
        .await
}

/// Record the outcome of a claimed record.
pub async fn finalize(store: &dyn RecordStore, id: &str, outcome: Outcome) -> Result<()> {
    store.set_status(id, outcome.into(), Utc::now()).await
}

pub async fn status_counts(store: &dyn RecordStore) -> Result<BTreeMap<RecordStatus, u64>> {
    store.status_counts().await
}

/// Reset up to `limit` FAILED records that failed within `since` back to PENDING.
///
/// Returns the number actually reset. Records that changed state between the
/// lookup and the reset are skipped.
#[instrument(level = "info", skip(store))]
pub async fn reset_failed(store: &dyn RecordStore, limit: usize, since: Duration) -> Result<usize> {
    if limit == 0 {
        return Ok(0);
    }
    let now = Utc::now();
    let candidates = store.failed_since(now - since, limit).await?;

    let mut reset = 0;
    for id in &candidates {
        if store
            .compare_and_set_status(id, RecordStatus::Failed, RecordStatus::Pending, now)
            .await?
        {
            reset += 1;
        }
    }
    info!(candidates = candidates.len(), reset, "Reset failed records");
    Ok(reset)
}

/// Reject a store result that claims to be a record with a different id.
pub(crate) fn ensure_same_id(expected: &str, record: &IngestedRecord) -> Result<()> {
    if record.id == expected {
        Ok(())
    } else {
        Err(PipelineError::Persistence(format!(
            "store returned record {} for id {expected}",
            record.id
        )))
    }
}
