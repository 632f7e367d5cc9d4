//! Persistent store for ingested records.
//!
//! [`RecordStore`] is the narrow interface the ingestion state machine needs:
//! upsert-by-id with conflict resolution, a conditional status update, a
//! status-filtered range query ordered by timestamp, and per-status counts.
//! Analysis results and daily summaries are kept alongside the records.
//!
//! Every method is its own atomic unit. No transaction is held across a batch,
//! and nothing here needs cross-record atomicity.
//!
//! # Backends
//!
//! | Backend | Module | Conditional write |
//! |---------|--------|-------------------|
//! | In-process | [`memory`] | check-and-set under one write lock |
//! | Supabase (PostgREST) | [`supabase`] | `PATCH ... ?news_id=eq.X&status=eq.PENDING` |

use crate::error::Result;
use crate::models::{ClaimableRecord, FetchedItem, IngestedRecord, RecordSource, RecordStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

pub mod memory;
pub mod supabase;

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    /// New row at version 1, status PENDING.
    Inserted,
    /// Existing row refreshed; carries the new version.
    Refreshed { version: u64 },
}

/// One stored analysis result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredAnalysis {
    pub news_id: String,
    pub analyzed_at: DateTime<Utc>,
    pub analysis_result: serde_json::Value,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record for `id`, or merge `item` into the existing one
    /// following [`crate::ingest::merge_record`].
    async fn upsert(
        &self,
        id: &str,
        item: &FetchedItem,
        source: RecordSource,
        now: DateTime<Utc>,
    ) -> Result<UpsertAction>;

    async fn get(&self, id: &str) -> Result<Option<IngestedRecord>>;

    /// Up to `limit` PENDING records, oldest `collected_at` first.
    async fn pending(&self, limit: usize) -> Result<Vec<ClaimableRecord>>;

    /// Set `status = next` only if the current status is exactly `expected`.
    ///
    /// Returns whether this call performed the write. Must be a single atomic
    /// operation in the backend: this is what makes claims at-most-once.
    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: RecordStatus,
        next: RecordStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Unconditional status write.
    async fn set_status(&self, id: &str, status: RecordStatus, now: DateTime<Utc>) -> Result<()>;

    /// Ids of FAILED records whose status changed at or after `since`, oldest first.
    async fn failed_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<String>>;

    /// Count of records per status; every status is present, zero included.
    async fn status_counts(&self) -> Result<BTreeMap<RecordStatus, u64>>;

    /// Store the analysis result for `id`, replacing any previous one.
    async fn save_analysis(&self, id: &str, analysis: &serde_json::Value, now: DateTime<Utc>) -> Result<()>;

    /// Analyses with `start <= analyzed_at < end`, oldest first.
    async fn analyses_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<StoredAnalysis>>;

    /// Store the market summary for `summary_date`, replacing any previous one.
    async fn save_daily_summary(&self, summary_date: NaiveDate, summary: &serde_json::Value) -> Result<()>;
}
