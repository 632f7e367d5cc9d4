//! Article analysis over claimed records.
//!
//! A batch picks up to `limit` PENDING records, claims each one with the
//! conditional PENDING -> PROCESSING write, analyzes it, stores the result,
//! and finalizes it as DONE or FAILED. Records another runner claimed first
//! are skipped without counting as processed.
//!
//! [`summary`] rolls one day's stored analyses up into a market summary.

pub mod openai;
pub mod summary;

use crate::error::{PipelineError, Result};
use crate::ingest::{Outcome, claim_pending, finalize, try_claim};
use crate::models::ClaimableRecord;
use crate::store::RecordStore;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument};

/// Sentiment labels an analysis may carry.
pub const SENTIMENT_LABELS: [&str; 3] = ["bullish", "neutral", "bearish"];

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Structured analysis of one article, as a JSON object.
    async fn analyze(&self, record: &ClaimableRecord) -> Result<Value>;

    /// Daily market summary over one day's validated analyses.
    async fn summarize(&self, summary_date: NaiveDate, analyses: &[Value]) -> Result<Value>;
}

/// Counters for one analysis batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisReport {
    /// PENDING records read.
    pub picked: usize,
    /// Records this batch claimed.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Check the fields every stored analysis must carry.
pub fn validate_analysis(value: &Value) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| PipelineError::Analysis("analysis is not a JSON object".to_string()))?;

    let label = obj.get("sentimentLabel").and_then(Value::as_str).unwrap_or_default();
    if !SENTIMENT_LABELS.contains(&label) {
        return Err(PipelineError::Analysis(format!("invalid sentimentLabel {label:?}")));
    }

    match obj.get("sentimentScore").and_then(Value::as_f64) {
        Some(score) if (-1.0..=1.0).contains(&score) => {}
        other => {
            return Err(PipelineError::Analysis(format!(
                "sentimentScore out of range: {other:?}"
            )));
        }
    }

    let summary = obj.get("summary").and_then(Value::as_str).unwrap_or_default();
    if summary.trim().is_empty() {
        return Err(PipelineError::Analysis("empty summary".to_string()));
    }
    Ok(())
}

async fn analyze_and_save(store: &dyn RecordStore, analyzer: &dyn Analyzer, record: &ClaimableRecord) -> Result<()> {
    let analysis = analyzer.analyze(record).await?;
    validate_analysis(&analysis)?;
    store.save_analysis(&record.id, &analysis, Utc::now()).await?;
    finalize(store, &record.id, Outcome::Done).await
}

/// Analyze up to `limit` PENDING records, one at a time.
///
/// A failing analysis marks its record FAILED and the batch moves on. Only a
/// failure to read the queue or to write the FAILED status aborts the batch.
#[instrument(level = "info", skip(store, analyzer))]
pub async fn run_analysis_batch(
    store: &dyn RecordStore,
    analyzer: &dyn Analyzer,
    limit: usize,
) -> Result<AnalysisReport> {
    let pending = claim_pending(store, limit).await?;
    let mut report = AnalysisReport {
        picked: pending.len(),
        ..Default::default()
    };

    for record in &pending {
        if !try_claim(store, &record.id).await? {
            info!(news_id = %record.id, "Already claimed elsewhere; skipping");
            continue;
        }
        report.processed += 1;

        match analyze_and_save(store, analyzer, record).await {
            Ok(()) => report.succeeded += 1,
            Err(e) => {
                error!(news_id = %record.id, error = %e, "Analysis failed");
                finalize(store, &record.id, Outcome::Failed).await?;
                report.failed += 1;
            }
        }
    }

    info!(
        picked = report.picked,
        processed = report.processed,
        succeeded = report.succeeded,
        failed = report.failed,
        "Analysis batch finished"
    );
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::models::{FetchedItem, RecordSource, RecordStatus};
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    async fn seed(store: &MemoryStore, articles: &[&str]) {
        for article in articles {
            let item = FetchedItem {
                url: format!("https://n.news.naver.com/mnews/article/015/{article}"),
                title: format!("title {article}"),
                body: "body".to_string(),
                published_at: String::new(),
            };
            store
                .upsert(&format!("015#{article}"), &item, RecordSource::NaverFinanceMainnews, Utc::now())
                .await
                .unwrap();
        }
    }

    async fn status_of(store: &MemoryStore, id: &str) -> RecordStatus {
        store.get(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_batch_finalizes_each_record() {
        let store = MemoryStore::new();
        seed(&store, &["1", "2", "3"]).await;
        let analyzer = ScriptedAnalyzer::failing_on(&["015#2"]);

        let report = run_analysis_batch(&store, &analyzer, 10).await.unwrap();
        assert_eq!(
            report,
            AnalysisReport {
                picked: 3,
                processed: 3,
                succeeded: 2,
                failed: 1
            }
        );
        assert_eq!(status_of(&store, "015#1").await, RecordStatus::Done);
        assert_eq!(status_of(&store, "015#2").await, RecordStatus::Failed);
        assert_eq!(status_of(&store, "015#3").await, RecordStatus::Done);
        assert!(store.analysis("015#1").await.is_some());
        assert!(store.analysis("015#2").await.is_none());
    }

    #[tokio::test]
    async fn test_batch_respects_limit() {
        let store = MemoryStore::new();
        seed(&store, &["1", "2", "3"]).await;
        let analyzer = ScriptedAnalyzer::default();

        let report = run_analysis_batch(&store, &analyzer, 2).await.unwrap();
        assert_eq!(report.picked, 2);
        assert_eq!(*analyzer.seen.lock().unwrap(), vec!["015#1", "015#2"]);
        assert_eq!(status_of(&store, "015#3").await, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn test_lost_claim_is_skipped() {
        struct ClaimingAnalyzer<'a> {
            store: &'a MemoryStore,
        }

        // Claims the next record out from under the batch before answering.
        #[async_trait]
        impl Analyzer for ClaimingAnalyzer<'_> {
            async fn analyze(&self, _record: &ClaimableRecord) -> Result<Value> {
                try_claim(self.store, "015#2").await?;
                Ok(sample_analysis("t"))
            }

            async fn summarize(&self, _date: NaiveDate, _analyses: &[Value]) -> Result<Value> {
                unreachable!("batch never summarizes")
            }
        }

        let store = MemoryStore::new();
        seed(&store, &["1", "2"]).await;
        let analyzer = ClaimingAnalyzer { store: &store };

        let report = run_analysis_batch(&store, &analyzer, 10).await.unwrap();
        assert_eq!(report.picked, 2);
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(status_of(&store, "015#2").await, RecordStatus::Processing);
    }

    #[tokio::test]
    async fn test_invalid_analysis_marks_failed() {
        let store = MemoryStore::new();
        seed(&store, &["1"]).await;

        struct InvalidAnalyzer;
        #[async_trait]
        impl Analyzer for InvalidAnalyzer {
            async fn analyze(&self, _record: &ClaimableRecord) -> Result<Value> {
                Ok(json!({"sentimentLabel": "euphoric", "sentimentScore": 0.1, "summary": "x"}))
            }

            async fn summarize(&self, _date: NaiveDate, _analyses: &[Value]) -> Result<Value> {
                unreachable!("batch never summarizes")
            }
        }

        let report = run_analysis_batch(&store, &InvalidAnalyzer, 10).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(status_of(&store, "015#1").await, RecordStatus::Failed);
    }

    #[test]
    fn test_validate_analysis() {
        assert!(validate_analysis(&sample_analysis("t")).is_ok());
        assert!(validate_analysis(&json!([1, 2])).is_err());
        assert!(validate_analysis(&json!({"sentimentLabel": "neutral", "sentimentScore": 1.5, "summary": "s"})).is_err());
        assert!(validate_analysis(&json!({"sentimentLabel": "neutral", "sentimentScore": 0.0, "summary": "  "})).is_err());
    }
}
