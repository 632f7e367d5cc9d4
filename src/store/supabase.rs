//! Supabase store over the PostgREST HTTP API.
//!
//! Tables:
//! - `raw_news`: one row per [`IngestedRecord`], primary key `news_id`
//! - `news_analysis`: one row per analyzed record, primary key `news_id`
//! - `market_daily_summary`: one row per day, primary key `summary_date`
//!
//! Conditional writes are expressed as filtered `PATCH` requests with
//! `Prefer: return=representation`; a write "won" when the response contains
//! the row. Upserts read the current row, merge, and write back filtered on the
//! version they read, retrying a few times if another writer got there first.

use super::{RecordStore, StoredAnalysis, UpsertAction};
use crate::error::{PipelineError, Result};
use crate::ingest::{ensure_same_id, merge_record};
use crate::models::{ClaimableRecord, FetchedItem, IngestedRecord, RecordSource, RecordStatus};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use futures::future::try_join_all;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

const RAW_NEWS: &str = "raw_news";
const NEWS_ANALYSIS: &str = "news_analysis";
const MARKET_DAILY_SUMMARY: &str = "market_daily_summary";
const CLAIMABLE_COLUMNS: &str = "news_id,title,body,published_at,collected_at,source";

/// Attempts at the read-merge-write cycle before an upsert gives up.
const MAX_UPSERT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    client: Client,
    rest_url: String,
    service_key: String,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    news_id: String,
}

impl SupabaseStore {
    /// `project_url` is the project base URL, e.g. `https://xyz.supabase.co`.
    pub fn new(client: Client, project_url: &str, service_key: impl Into<String>) -> Self {
        Self {
            client,
            rest_url: format!("{}/rest/v1", project_url.trim_end_matches('/')),
            service_key: service_key.into(),
        }
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn checked(req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await.map_err(persistence)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(PipelineError::Persistence(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(&body, 300)
        )))
    }

    async fn rows<T: DeserializeOwned>(req: RequestBuilder) -> Result<Vec<T>> {
        Self::checked(req).await?.json::<Vec<T>>().await.map_err(persistence)
    }

    async fn insert_if_absent(&self, record: &IngestedRecord) -> Result<bool> {
        let req = self
            .request(Method::POST, RAW_NEWS)
            .query(&[("on_conflict", "news_id")])
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(record);
        let inserted: Vec<IdRow> = Self::rows(req).await?;
        Ok(!inserted.is_empty())
    }

    async fn update_if_version(&self, record: &IngestedRecord, read_version: u64) -> Result<bool> {
        let req = self
            .request(Method::PATCH, RAW_NEWS)
            .query(&[
                ("news_id", format!("eq.{}", record.id)),
                ("version", format!("eq.{read_version}")),
                ("select", "news_id".to_string()),
            ])
            .header("Prefer", "return=representation")
            .json(record);
        let updated: Vec<IdRow> = Self::rows(req).await?;
        Ok(!updated.is_empty())
    }

    async fn count_status(&self, status: RecordStatus) -> Result<(RecordStatus, u64)> {
        let req = self
            .request(Method::GET, RAW_NEWS)
            .query(&[
                ("select", "news_id".to_string()),
                ("status", format!("eq.{status}")),
                ("limit", "1".to_string()),
            ])
            .header("Prefer", "count=exact");
        let resp = Self::checked(req).await?;
        let count = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| PipelineError::Persistence(format!("missing row count for {status}")))?;
        Ok((status, count))
    }
}

fn persistence(e: reqwest::Error) -> PipelineError {
    PipelineError::Persistence(e.to_string())
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Total from a PostgREST `Content-Range` header: `0-0/42` or `*/0`.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

#[async_trait]
impl RecordStore for SupabaseStore {
    #[instrument(level = "debug", skip(self, item, now))]
    async fn upsert(
        &self,
        id: &str,
        item: &FetchedItem,
        source: RecordSource,
        now: DateTime<Utc>,
    ) -> Result<UpsertAction> {
        for attempt in 1..=MAX_UPSERT_ATTEMPTS {
            let existing = self.get(id).await?;
            let merged = merge_record(existing.as_ref(), id, item, source, now);

            let won = match &existing {
                None => self.insert_if_absent(&merged).await?,
                Some(prev) => self.update_if_version(&merged, prev.version).await?,
            };
            if won {
                return Ok(match existing {
                    None => UpsertAction::Inserted,
                    Some(_) => UpsertAction::Refreshed {
                        version: merged.version,
                    },
                });
            }
            debug!(attempt, "Concurrent write on upsert; re-reading");
        }
        warn!(attempts = MAX_UPSERT_ATTEMPTS, "Upsert kept losing to concurrent writers");
        Err(PipelineError::Persistence(format!(
            "concurrent modification of {id}; gave up after {MAX_UPSERT_ATTEMPTS} attempts"
        )))
    }

    async fn get(&self, id: &str) -> Result<Option<IngestedRecord>> {
        let req = self
            .request(Method::GET, RAW_NEWS)
            .query(&[("news_id", format!("eq.{id}")), ("select", "*".to_string())]);
        let rows: Vec<IngestedRecord> = Self::rows(req).await?;
        match rows.into_iter().next() {
            Some(record) => {
                ensure_same_id(id, &record)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn pending(&self, limit: usize) -> Result<Vec<ClaimableRecord>> {
        let req = self.request(Method::GET, RAW_NEWS).query(&[
            ("select", CLAIMABLE_COLUMNS.to_string()),
            ("status", format!("eq.{}", RecordStatus::Pending)),
            ("order", "collected_at.asc,news_id.asc".to_string()),
            ("limit", limit.to_string()),
        ]);
        Self::rows(req).await
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: RecordStatus,
        next: RecordStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let req = self
            .request(Method::PATCH, RAW_NEWS)
            .query(&[
                ("news_id", format!("eq.{id}")),
                ("status", format!("eq.{expected}")),
                ("select", "news_id".to_string()),
            ])
            .header("Prefer", "return=representation")
            .json(&json!({ "status": next, "status_changed_at": timestamp(now) }));
        let updated: Vec<IdRow> = Self::rows(req).await?;
        Ok(!updated.is_empty())
    }

    async fn set_status(&self, id: &str, status: RecordStatus, now: DateTime<Utc>) -> Result<()> {
        let req = self
            .request(Method::PATCH, RAW_NEWS)
            .query(&[("news_id", format!("eq.{id}")), ("select", "news_id".to_string())])
            .header("Prefer", "return=representation")
            .json(&json!({ "status": status, "status_changed_at": timestamp(now) }));
        let updated: Vec<IdRow> = Self::rows(req).await?;
        if updated.is_empty() {
            return Err(PipelineError::Persistence(format!("record {id} not found")));
        }
        Ok(())
    }

    async fn failed_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let req = self.request(Method::GET, RAW_NEWS).query(&[
            ("select", "news_id".to_string()),
            ("status", format!("eq.{}", RecordStatus::Failed)),
            ("status_changed_at", format!("gte.{}", timestamp(since))),
            ("order", "status_changed_at.asc".to_string()),
            ("limit", limit.to_string()),
        ]);
        let rows: Vec<IdRow> = Self::rows(req).await?;
        Ok(rows.into_iter().map(|r| r.news_id).collect())
    }

    async fn status_counts(&self) -> Result<BTreeMap<RecordStatus, u64>> {
        let counts = try_join_all(RecordStatus::ALL.iter().map(|s| self.count_status(*s))).await?;
        Ok(counts.into_iter().collect())
    }

    async fn save_analysis(&self, id: &str, analysis: &serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        let req = self
            .request(Method::POST, NEWS_ANALYSIS)
            .query(&[("on_conflict", "news_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!({
                "news_id": id,
                "analysis_result": analysis,
                "analyzed_at": timestamp(now),
            }));
        Self::checked(req).await?;
        Ok(())
    }

    async fn analyses_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<StoredAnalysis>> {
        let req = self.request(Method::GET, NEWS_ANALYSIS).query(&[
            ("select", "news_id,analyzed_at,analysis_result".to_string()),
            ("analyzed_at", format!("gte.{}", timestamp(start))),
            ("analyzed_at", format!("lt.{}", timestamp(end))),
            ("order", "analyzed_at.asc".to_string()),
        ]);
        Self::rows(req).await
    }

    async fn save_daily_summary(&self, summary_date: NaiveDate, summary: &serde_json::Value) -> Result<()> {
        let req = self
            .request(Method::POST, MARKET_DAILY_SUMMARY)
            .query(&[("on_conflict", "summary_date")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!({
                "summary_date": summary_date.to_string(),
                "summary_result": summary,
            }));
        Self::checked(req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::testing::serve_http;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("0-0/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_rest_url_trims_trailing_slash() {
        let store = SupabaseStore::new(Client::new(), "https://xyz.supabase.co/", "key");
        assert_eq!(store.rest_url, "https://xyz.supabase.co/rest/v1");
    }

    #[test]
    fn test_timestamp_format() {
        let t = DateTime::parse_from_rfc3339("2025-05-06T00:30:00+09:00").unwrap().with_timezone(&Utc);
        assert_eq!(timestamp(t), "2025-05-05T15:30:00.000Z");
    }

    #[tokio::test]
    async fn test_pending_query_shape() {
        let server = serve_http(200, "[]").await;
        let client = Client::builder().no_proxy().build().unwrap();
        let store = SupabaseStore::new(client, &server.base_url, "key");

        assert!(store.pending(5).await.unwrap().is_empty());

        let line = server.request_lines.lock().unwrap()[0].clone();
        assert!(line.starts_with("GET /rest/v1/raw_news?"), "{line}");
        assert!(line.contains("status=eq.PENDING"), "{line}");
        assert!(line.contains("order=collected_at.asc%2Cnews_id.asc"), "{line}");
        assert!(line.contains("limit=5"), "{line}");
    }

    #[tokio::test]
    async fn test_claim_lost_when_no_row_returned() {
        let server = serve_http(200, "[]").await;
        let client = Client::builder().no_proxy().build().unwrap();
        let store = SupabaseStore::new(client, &server.base_url, "key");

        let won = store
            .compare_and_set_status("015#1", RecordStatus::Pending, RecordStatus::Processing, Utc::now())
            .await
            .unwrap();
        assert!(!won);

        let line = server.request_lines.lock().unwrap()[0].clone();
        assert!(line.starts_with("PATCH /rest/v1/raw_news?"), "{line}");
        assert!(line.contains("news_id=eq.015%231"), "{line}");
        assert!(line.contains("status=eq.PENDING"), "{line}");
    }

    #[tokio::test]
    async fn test_claim_won_when_row_returned() {
        let server = serve_http(200, r#"[{"news_id":"015#1"}]"#).await;
        let client = Client::builder().no_proxy().build().unwrap();
        let store = SupabaseStore::new(client, &server.base_url, "key");

        let won = store
            .compare_and_set_status("015#1", RecordStatus::Pending, RecordStatus::Processing, Utc::now())
            .await
            .unwrap();
        assert!(won);
    }

    #[tokio::test]
    async fn test_http_error_is_persistence_error() {
        let server = serve_http(500, r#"{"message":"db down"}"#).await;
        let client = Client::builder().no_proxy().build().unwrap();
        let store = SupabaseStore::new(client, &server.base_url, "key");

        let err = store.set_status("015#1", RecordStatus::Done, Utc::now()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(ref m) if m.contains("HTTP 500") && m.contains("db down")));
    }

    #[tokio::test]
    async fn test_analyses_between_query_and_rows() {
        let body = r#"[{"news_id":"015#1","analyzed_at":"2025-05-05T16:00:00.5+00:00","analysis_result":{"summary":"s"}}]"#;
        let server = serve_http(200, body).await;
        let client = Client::builder().no_proxy().build().unwrap();
        let store = SupabaseStore::new(client, &server.base_url, "key");
        let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);

        let rows = store
            .analyses_between(at("2025-05-05T15:00:00Z"), at("2025-05-06T15:00:00Z"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].news_id, "015#1");
        assert_eq!(rows[0].analysis_result["summary"], "s");

        let line = server.request_lines.lock().unwrap()[0].clone();
        assert!(line.starts_with("GET /rest/v1/news_analysis?"), "{line}");
        assert!(line.contains("analyzed_at=gte.2025-05-05T15%3A00%3A00.000Z"), "{line}");
        assert!(line.contains("analyzed_at=lt.2025-05-06T15%3A00%3A00.000Z"), "{line}");
    }

    #[tokio::test]
    async fn test_save_daily_summary_upserts_by_date() {
        let server = serve_http(201, "").await;
        let client = Client::builder().no_proxy().build().unwrap();
        let store = SupabaseStore::new(client, &server.base_url, "key");

        let date = NaiveDate::from_ymd_opt(2025, 5, 6).unwrap();
        store.save_daily_summary(date, &json!({"summary": "s"})).await.unwrap();

        let line = server.request_lines.lock().unwrap()[0].clone();
        assert!(line.starts_with("POST /rest/v1/market_daily_summary?on_conflict=summary_date"), "{line}");
    }
}
