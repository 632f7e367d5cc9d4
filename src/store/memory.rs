//! In-process record store.
//!
//! All rows live behind one [`tokio::sync::RwLock`]; every mutating call takes
//! the write lock for its whole read-modify-write, which is what makes
//! [`RecordStore::compare_and_set_status`] atomic here. Used when no external
//! store is configured, and by tests.

use super::{RecordStore, StoredAnalysis, UpsertAction};
use crate::error::{PipelineError, Result};
use crate::ingest::merge_record;
use crate::models::{ClaimableRecord, FetchedItem, IngestedRecord, RecordSource, RecordStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug)]
struct Row {
    /// Insertion order; breaks `collected_at` ties.
    seq: u64,
    record: IngestedRecord,
}

#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<String, Row>,
    analyses: HashMap<String, (serde_json::Value, DateTime<Utc>)>,
    summaries: BTreeMap<NaiveDate, serde_json::Value>,
    next_seq: u64,
    rejected: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write touching `id` fail with a persistence error.
    #[cfg(test)]
    pub async fn reject_writes_for(&self, id: &str) {
        self.inner.write().await.rejected.insert(id.to_string());
    }

    /// Stored analysis result for `id`, if any.
    #[cfg(test)]
    pub async fn analysis(&self, id: &str) -> Option<serde_json::Value> {
        self.inner.read().await.analyses.get(id).map(|(v, _)| v.clone())
    }

    #[cfg(test)]
    pub async fn daily_summary(&self, summary_date: NaiveDate) -> Option<serde_json::Value> {
        self.inner.read().await.summaries.get(&summary_date).cloned()
    }
}

impl Inner {
    fn check_writable(&self, id: &str) -> Result<()> {
        if self.rejected.contains(id) {
            Err(PipelineError::Persistence(format!("write rejected for {id}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(
        &self,
        id: &str,
        item: &FetchedItem,
        source: RecordSource,
        now: DateTime<Utc>,
    ) -> Result<UpsertAction> {
        let mut inner = self.inner.write().await;
        inner.check_writable(id)?;

        if let Some(row) = inner.rows.get_mut(id) {
            row.record = merge_record(Some(&row.record), id, item, source, now);
            return Ok(UpsertAction::Refreshed {
                version: row.record.version,
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let record = merge_record(None, id, item, source, now);
        inner.rows.insert(id.to_string(), Row { seq, record });
        Ok(UpsertAction::Inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<IngestedRecord>> {
        Ok(self.inner.read().await.rows.get(id).map(|r| r.record.clone()))
    }

    async fn pending(&self, limit: usize) -> Result<Vec<ClaimableRecord>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<&Row> = inner
            .rows
            .values()
            .filter(|r| r.record.status == RecordStatus::Pending)
            .collect();
        rows.sort_by_key(|r| (r.record.collected_at, r.seq));
        Ok(rows.into_iter().take(limit).map(|r| r.record.claimable()).collect())
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: RecordStatus,
        next: RecordStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        inner.check_writable(id)?;
        match inner.rows.get_mut(id) {
            Some(row) if row.record.status == expected => {
                row.record.status = next;
                row.record.status_changed_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(&self, id: &str, status: RecordStatus, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_writable(id)?;
        let row = inner
            .rows
            .get_mut(id)
            .ok_or_else(|| PipelineError::Persistence(format!("record {id} not found")))?;
        if !row.record.status.can_transition_to(status) {
            warn!(%id, from = %row.record.status, to = %status, "Status write outside the normal lifecycle");
        }
        row.record.status = status;
        row.record.status_changed_at = now;
        Ok(())
    }

    async fn failed_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<&Row> = inner
            .rows
            .values()
            .filter(|r| r.record.status == RecordStatus::Failed && r.record.status_changed_at >= since)
            .collect();
        rows.sort_by_key(|r| (r.record.status_changed_at, r.seq));
        Ok(rows.into_iter().take(limit).map(|r| r.record.id.clone()).collect())
    }

    async fn status_counts(&self) -> Result<BTreeMap<RecordStatus, u64>> {
        let inner = self.inner.read().await;
        let mut counts: BTreeMap<RecordStatus, u64> = RecordStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in inner.rows.values() {
            *counts.entry(row.record.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn save_analysis(&self, id: &str, analysis: &serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_writable(id)?;
        inner.analyses.insert(id.to_string(), (analysis.clone(), now));
        Ok(())
    }

    async fn analyses_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<StoredAnalysis>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<StoredAnalysis> = inner
            .analyses
            .iter()
            .filter(|(_, (_, at))| *at >= start && *at < end)
            .map(|(id, (value, at))| StoredAnalysis {
                news_id: id.clone(),
                analyzed_at: *at,
                analysis_result: value.clone(),
            })
            .collect();
        rows.sort_by(|a, b| (a.analyzed_at, &a.news_id).cmp(&(b.analyzed_at, &b.news_id)));
        Ok(rows)
    }

    async fn save_daily_summary(&self, summary_date: NaiveDate, summary: &serde_json::Value) -> Result<()> {
        self.inner.write().await.summaries.insert(summary_date, summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(article: &str) -> FetchedItem {
        FetchedItem {
            url: format!("https://n.news.naver.com/mnews/article/015/{article}"),
            title: "t".to_string(),
            body: "b".to_string(),
            published_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_pending_ties_break_by_insertion_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for article in ["9", "3", "5"] {
            store
                .upsert(&format!("015#{article}"), &item(article), RecordSource::NaverFinanceMainnews, now)
                .await
                .unwrap();
        }
        let ids: Vec<String> = store.pending(10).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["015#9", "015#3", "015#5"]);
    }

    #[tokio::test]
    async fn test_counts_include_every_status() {
        let store = MemoryStore::new();
        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|c| *c == 0));
    }

    #[tokio::test]
    async fn test_save_analysis_replaces_previous() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.save_analysis("015#1", &serde_json::json!({"v": 1}), now).await.unwrap();
        store.save_analysis("015#1", &serde_json::json!({"v": 2}), now).await.unwrap();
        assert_eq!(store.analysis("015#1").await, Some(serde_json::json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_upsert_reports_new_version() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let src = RecordSource::NaverFinanceMainnews;
        assert_eq!(store.upsert("015#1", &item("1"), src, now).await.unwrap(), UpsertAction::Inserted);
        assert_eq!(
            store.upsert("015#1", &item("1"), src, now).await.unwrap(),
            UpsertAction::Refreshed { version: 2 }
        );
        assert_eq!(
            store.upsert("015#1", &item("1"), src, now).await.unwrap(),
            UpsertAction::Refreshed { version: 3 }
        );
    }

    #[tokio::test]
    async fn test_analyses_between_is_half_open_and_ordered() {
        let store = MemoryStore::new();
        let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        let v = serde_json::json!({});
        store.save_analysis("015#late", &v, at("2025-05-06T12:00:00Z")).await.unwrap();
        store.save_analysis("015#early", &v, at("2025-05-06T01:00:00Z")).await.unwrap();
        store.save_analysis("015#start", &v, at("2025-05-06T00:00:00Z")).await.unwrap();
        store.save_analysis("015#end", &v, at("2025-05-07T00:00:00Z")).await.unwrap();

        let rows = store
            .analyses_between(at("2025-05-06T00:00:00Z"), at("2025-05-07T00:00:00Z"))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.news_id.as_str()).collect();
        assert_eq!(ids, vec!["015#start", "015#early", "015#late"]);
    }
}
