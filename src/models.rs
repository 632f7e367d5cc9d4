//! Data models for collected articles and their stored lifecycle.
//!
//! This module defines the core data structures used throughout the application:
//! - [`CanonicalItemId`]: stable identity of an article, derived from its URL
//! - [`FetchedItem`] / [`FetchFailure`]: the two outcomes of fetching one article
//! - [`IngestedRecord`]: the stored row, with its [`RecordStatus`] and `version`
//! - [`ClaimableRecord`]: the projection handed to the analysis consumer
//! - [`JobRuntimeState`]: in-memory single-flight state of one job kind
//!
//! Field names on the stored types follow the `raw_news` table columns, hence
//! the serde renames.

use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Host serving the canonical article pages.
pub const ARTICLE_BASE_URL: &str = "https://n.news.naver.com";

static ARTICLE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/mnews/article/(\d+)/(\d+)").expect("article path regex"));

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Identity of one article: the publishing office and the article number.
///
/// Both components are kept as digit strings so leading zeros survive
/// (`015` and `15` are different offices). The stored form is
/// `{office}#{article}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalItemId {
    office_id: String,
    article_id: String,
}

impl CanonicalItemId {
    /// Build an id from its two components; both must be non-empty and all digits.
    pub fn new(office_id: &str, article_id: &str) -> Option<Self> {
        if is_numeric(office_id) && is_numeric(article_id) {
            Some(Self {
                office_id: office_id.to_string(),
                article_id: article_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Derive the id from an article page URL such as
    /// `https://n.news.naver.com/mnews/article/015/0005249661`.
    pub fn from_article_url(url: &str) -> Result<Self, PipelineError> {
        let parsed = Url::parse(url).map_err(|_| PipelineError::InvalidUrlFormat(url.to_string()))?;
        let caps = ARTICLE_PATH
            .captures(parsed.path())
            .ok_or_else(|| PipelineError::InvalidUrlFormat(url.to_string()))?;
        Self::new(&caps[1], &caps[2]).ok_or_else(|| PipelineError::InvalidUrlFormat(url.to_string()))
    }

    #[cfg(test)]
    pub fn office_id(&self) -> &str {
        &self.office_id
    }

    #[cfg(test)]
    pub fn article_id(&self) -> &str {
        &self.article_id
    }

    /// The article page this id points at.
    pub fn canonical_url(&self) -> String {
        format!(
            "{}/mnews/article/{}/{}",
            ARTICLE_BASE_URL, self.office_id, self.article_id
        )
    }
}

impl fmt::Display for CanonicalItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.office_id, self.article_id)
    }
}

impl FromStr for CanonicalItemId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_once('#')
            .and_then(|(office, article)| Self::new(office, article))
            .ok_or_else(|| PipelineError::InvalidUrlFormat(s.to_string()))
    }
}

/// An article as returned by a fetcher.
///
/// Any field the fetcher could not locate is an empty string; that is not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedItem {
    pub url: String,
    pub title: String,
    pub body: String,
    pub published_at: String,
}

/// One article whose fetch raised an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFailure {
    pub url: String,
    pub error_message: String,
}

/// Lifecycle of a stored record.
///
/// Legal edges:
/// ```text
/// PENDING -> PROCESSING -> DONE
///                       -> FAILED -> PENDING (operator retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 4] = [
        RecordStatus::Pending,
        RecordStatus::Processing,
        RecordStatus::Done,
        RecordStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Processing => "PROCESSING",
            RecordStatus::Done => "DONE",
            RecordStatus::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Done) | (Processing, Failed) | (Failed, Pending)
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    NaverFinanceMainnews,
    NaverNewsSingle,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::NaverFinanceMainnews => "naver_finance_mainnews",
            RecordSource::NaverNewsSingle => "naver_news_single",
        }
    }
}

/// A stored article row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedRecord {
    #[serde(rename = "news_id")]
    pub id: String,
    pub url: String,
    pub title: String,
    pub body: String,
    pub published_at: String,
    pub collected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub source: RecordSource,
    pub status: RecordStatus,
    /// Starts at 1 and only ever increases.
    pub version: u64,
    /// Last time `status` was written; bounds the retry-failed window.
    pub status_changed_at: DateTime<Utc>,
}

impl IngestedRecord {
    pub fn claimable(&self) -> ClaimableRecord {
        ClaimableRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            published_at: self.published_at.clone(),
            collected_at: self.collected_at,
            source: self.source,
        }
    }
}

/// What the analysis consumer sees of a PENDING record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimableRecord {
    #[serde(rename = "news_id")]
    pub id: String,
    pub title: String,
    pub body: String,
    pub published_at: String,
    pub collected_at: DateTime<Utc>,
    pub source: RecordSource,
}

/// The two independently locked job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scrape,
    Analysis,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Scrape => f.write_str("scrape"),
            JobKind::Analysis => f.write_str("analysis"),
        }
    }
}

/// Who asked for a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Cron,
    RetryManual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Manual => f.write_str("manual"),
            TriggerSource::Cron => f.write_str("cron"),
            TriggerSource::RetryManual => f.write_str("retry_manual"),
        }
    }
}

/// Runtime state of one job kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRuntimeState {
    pub running: bool,
    #[serde(rename = "runningSince")]
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_from_article_url() {
        let id = CanonicalItemId::from_article_url("https://n.news.naver.com/mnews/article/015/0005249661")
            .unwrap();
        assert_eq!(id.office_id(), "015");
        assert_eq!(id.article_id(), "0005249661");
        assert_eq!(id.to_string(), "015#0005249661");
    }

    #[test]
    fn test_id_ignores_trailing_path_and_query() {
        let id = CanonicalItemId::from_article_url(
            "https://n.news.naver.com/mnews/article/001/0000000042/comment?sid=101",
        )
        .unwrap();
        assert_eq!(id.to_string(), "001#0000000042");
    }

    #[test]
    fn test_id_rejects_other_shapes() {
        for url in [
            "https://n.news.naver.com/mnews/article/abc/123",
            "https://n.news.naver.com/article/015/123",
            "https://n.news.naver.com/mnews/article/015",
            "not a url",
        ] {
            assert!(
                matches!(
                    CanonicalItemId::from_article_url(url),
                    Err(PipelineError::InvalidUrlFormat(_))
                ),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_id_keeps_leading_zeros_distinct() {
        let a = CanonicalItemId::new("015", "1").unwrap();
        let b = CanonicalItemId::new("15", "1").unwrap();
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_canonical_url_derives_same_id() {
        let id = CanonicalItemId::new("009", "0005512345").unwrap();
        let again = CanonicalItemId::from_article_url(&id.canonical_url()).unwrap();
        assert_eq!(id, again);
        assert_eq!(id.to_string().parse::<CanonicalItemId>().unwrap(), id);
    }

    #[test]
    fn test_new_rejects_non_numeric() {
        assert!(CanonicalItemId::new("", "1").is_none());
        assert!(CanonicalItemId::new("1", "1a").is_none());
    }

    #[test]
    fn test_status_transitions() {
        use RecordStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Done));
        assert!(!Done.can_transition_to(Pending));
        assert!(!Done.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_status_serializes_as_column_value() {
        assert_eq!(serde_json::to_string(&RecordStatus::Processing).unwrap(), "\"PROCESSING\"");
        let s: RecordStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(s, RecordStatus::Failed);
    }

    #[test]
    fn test_record_uses_news_id_column() {
        let now = Utc::now();
        let record = IngestedRecord {
            id: "015#1".to_string(),
            url: "https://n.news.naver.com/mnews/article/015/1".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            published_at: String::new(),
            collected_at: now,
            last_seen_at: now,
            source: RecordSource::NaverFinanceMainnews,
            status: RecordStatus::Pending,
            version: 1,
            status_changed_at: now,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["news_id"], "015#1");
        assert_eq!(json["source"], "naver_finance_mainnews");
        assert_eq!(json["status"], "PENDING");
    }

    #[test]
    fn test_runtime_state_serialization() {
        let state = JobRuntimeState::default();
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["running"], false);
        assert!(json["runningSince"].is_null());
    }
}
