//! Job bodies and their triggers.
//!
//! [`Pipeline`] wires the collector, the batch runner, the store, and the
//! analyzer together, and runs each job body under the [`JobController`]:
//!
//! - scrape: collect ids -> fetch batch -> upsert successes (scrape lock)
//! - analysis: claim and analyze PENDING records, then summarize the current
//!   day (analysis lock)
//! - retry-failed: reset recent FAILED records, then an analysis batch
//!   (analysis lock)

use crate::analysis::summary::{SummaryReport, build_daily_summary, summary_date};
use crate::analysis::{AnalysisReport, Analyzer, run_analysis_batch};
use crate::error::{PipelineError, Result};
use crate::ingest::{reset_failed, status_counts, upsert_batch};
use crate::jobs::{JobController, TriggerOutcome};
use crate::models::{CanonicalItemId, FetchedItem, JobKind, JobRuntimeState, RecordSource, RecordStatus, TriggerSource};
use crate::scrapers::{ArticleFetcher, FetchSession};
use crate::scrapers::batch::run_batch;
use crate::scrapers::collector::ListingCollector;
use crate::store::RecordStore;
use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Accepted `limit` for a retry-failed run.
pub const RETRY_LIMIT_RANGE: RangeInclusive<usize> = 1..=100;
/// Accepted look-back window, in hours, for a retry-failed run.
pub const RETRY_SINCE_HOURS_RANGE: RangeInclusive<u32> = 1..=168;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub listing_page: u32,
    pub collect_limit: usize,
    pub concurrency: usize,
    pub analysis_batch_size: usize,
    /// Offset whose calendar days the daily summary covers.
    pub day_offset: FixedOffset,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            listing_page: 1,
            collect_limit: 20,
            concurrency: 3,
            analysis_batch_size: 20,
            day_offset: Utc.fix(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeSummary {
    pub collected: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub inserted: usize,
    pub refreshed: usize,
    pub upsert_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySummary {
    pub reset: usize,
    pub analysis: AnalysisReport,
}

/// Result of the analysis job: one batch, then the day's summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRun {
    pub analysis: AnalysisReport,
    pub summary: SummaryReport,
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub scrape: JobRuntimeState,
    pub analysis: JobRuntimeState,
    pub status_counts: BTreeMap<RecordStatus, u64>,
}

pub struct Pipeline<F> {
    collector: ListingCollector,
    fetcher: F,
    store: Arc<dyn RecordStore>,
    analyzer: Option<Arc<dyn Analyzer>>,
    settings: PipelineSettings,
    jobs: JobController,
}

impl<F> Pipeline<F>
where
    F: ArticleFetcher + 'static,
{
    pub fn new(
        collector: ListingCollector,
        fetcher: F,
        store: Arc<dyn RecordStore>,
        analyzer: Option<Arc<dyn Analyzer>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            collector,
            fetcher,
            store,
            analyzer,
            settings,
            jobs: JobController::new(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn analyzer(&self) -> Result<&dyn Analyzer> {
        self.analyzer
            .as_deref()
            .ok_or_else(|| PipelineError::Config("OPENAI_API_KEY is required to run analysis".to_string()))
    }

    /// Collect one listing page, fetch its articles, and store the successes.
    ///
    /// Failed fetches are logged and never stored.
    #[instrument(level = "info", skip(self))]
    pub async fn scrape_and_ingest(&self) -> Result<ScrapeSummary> {
        let ids = self
            .collector
            .collect(self.settings.listing_page, self.settings.collect_limit)
            .await?;
        if ids.is_empty() {
            warn!("Listing page yielded no article ids");
        }

        let outcome = run_batch(&self.fetcher, &ids, self.settings.concurrency).await?;
        for failure in &outcome.failures {
            warn!(url = %failure.url, error = %failure.error_message, "Article not ingested");
        }

        let report = upsert_batch(self.store.as_ref(), &outcome.successes, RecordSource::NaverFinanceMainnews).await;

        Ok(ScrapeSummary {
            collected: ids.len(),
            fetched: outcome.successes.len(),
            fetch_failed: outcome.failures.len(),
            inserted: report.inserted(),
            refreshed: report.refreshed(),
            upsert_failed: report.failed(),
        })
    }

    /// Fetch and store one article given by URL, outside any job lock.
    ///
    /// Unlike a batch, a failed fetch is returned as an error.
    #[instrument(level = "info", skip(self))]
    pub async fn ingest_single(&self, url: &str) -> Result<FetchedItem> {
        let id = CanonicalItemId::from_article_url(url)?;
        let session = self.fetcher.open_session().await?;
        let fetched = session.fetch_one(&id.canonical_url()).await;
        session.close().await;
        let item = fetched?;

        let report = upsert_batch(self.store.as_ref(), std::slice::from_ref(&item), RecordSource::NaverNewsSingle).await;
        if let Some(entry) = report.entries.into_iter().next() {
            entry.result?;
        }
        Ok(item)
    }

    /// One analysis batch over up to `limit` PENDING records.
    pub async fn analyze_pending(&self, limit: usize) -> Result<AnalysisReport> {
        let analyzer = self.analyzer()?;
        run_analysis_batch(self.store.as_ref(), analyzer, limit).await
    }

    /// Build and store the market summary for `date`.
    pub async fn summarize_day(&self, date: NaiveDate) -> Result<SummaryReport> {
        let analyzer = self.analyzer()?;
        build_daily_summary(self.store.as_ref(), analyzer, date, self.settings.day_offset).await
    }

    /// Today's calendar date in the summary offset.
    pub fn today(&self) -> NaiveDate {
        summary_date(Utc::now(), self.settings.day_offset)
    }

    /// Analysis job body: one batch, then today's summary.
    #[instrument(level = "info", skip(self))]
    pub async fn analyze_and_summarize(&self, limit: usize) -> Result<AnalysisRun> {
        let analysis = self.analyze_pending(limit).await?;
        let summary = self.summarize_day(self.today()).await?;
        info!(
            processed = analysis.processed,
            succeeded = analysis.succeeded,
            failed = analysis.failed,
            summary_date = %summary.summary_date,
            analyzed_count = summary.analyzed_count,
            "Analysis completed"
        );
        Ok(AnalysisRun { analysis, summary })
    }

    /// Reset FAILED records from the last `since_hours` hours, then analyze.
    #[instrument(level = "info", skip(self))]
    pub async fn retry_failed(&self, limit: usize, since_hours: u32) -> Result<RetrySummary> {
        if !RETRY_LIMIT_RANGE.contains(&limit) {
            return Err(PipelineError::Config(format!(
                "limit must be within {RETRY_LIMIT_RANGE:?}, got {limit}"
            )));
        }
        if !RETRY_SINCE_HOURS_RANGE.contains(&since_hours) {
            return Err(PipelineError::Config(format!(
                "since_hours must be within {RETRY_SINCE_HOURS_RANGE:?}, got {since_hours}"
            )));
        }
        // Fail before touching any record if analysis cannot run.
        self.analyzer()?;

        let reset = reset_failed(self.store.as_ref(), limit, chrono::Duration::hours(i64::from(since_hours))).await?;
        info!(reset, "Failed records reset to PENDING");
        let analysis = self.analyze_pending(self.settings.analysis_batch_size).await?;
        Ok(RetrySummary { reset, analysis })
    }

    pub fn trigger_scrape(self: &Arc<Self>, source: TriggerSource) -> TriggerOutcome<ScrapeSummary> {
        let this = Arc::clone(self);
        self.jobs
            .trigger(JobKind::Scrape, source, async move { this.scrape_and_ingest().await })
    }

    pub fn trigger_analysis(self: &Arc<Self>, source: TriggerSource, limit: usize) -> TriggerOutcome<AnalysisRun> {
        let this = Arc::clone(self);
        self.jobs
            .trigger(JobKind::Analysis, source, async move { this.analyze_and_summarize(limit).await })
    }

    /// Runs under the analysis lock: a retry never overlaps an analysis batch.
    pub fn trigger_retry_failed(self: &Arc<Self>, limit: usize, since_hours: u32) -> TriggerOutcome<RetrySummary> {
        let this = Arc::clone(self);
        self.jobs.trigger(JobKind::Analysis, TriggerSource::RetryManual, async move {
            this.retry_failed(limit, since_hours).await
        })
    }

    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            scrape: self.jobs.runtime_state(JobKind::Scrape),
            analysis: self.jobs.runtime_state(JobKind::Analysis),
            status_counts: status_counts(self.store.as_ref()).await?,
        })
    }
}
