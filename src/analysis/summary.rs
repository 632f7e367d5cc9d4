//! Daily market summary.
//!
//! Reads every analysis stored during one local calendar day, keeps the ones
//! that still validate, and asks the analyzer to roll them up. A day with no
//! usable analyses gets a neutral placeholder instead, so every summarized day
//! has exactly one row.

use super::{Analyzer, validate_analysis};
use crate::error::{PipelineError, Result};
use crate::store::RecordStore;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

pub const MARKET_REGIMES: [&str; 3] = ["risk_on", "neutral", "risk_off"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReport {
    pub summary_date: NaiveDate,
    /// Analyses that went into the summary.
    pub analyzed_count: usize,
}

/// Calendar date of `now` in `offset`.
pub fn summary_date(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

/// `[start, end)` in UTC covering `date` as a local day in `offset`.
pub fn day_window(date: NaiveDate, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_midnight = date.and_time(NaiveTime::MIN);
    let start = Utc.from_utc_datetime(&(local_midnight - Duration::seconds(i64::from(offset.local_minus_utc()))));
    (start, start + Duration::days(1))
}

/// Placeholder stored for a day without analyzed news.
pub fn empty_day_summary(summary_date: NaiveDate) -> Value {
    json!({
        "summaryDate": summary_date.to_string(),
        "marketRegime": "neutral",
        "highlights": ["No analyzed news available for this date."],
        "topSectors": [],
        "topKeywords": [],
        "nextKeywords": [],
        "confidence": 0,
        "summary": "No analyzed news available.",
    })
}

pub fn validate_daily_summary(value: &Value) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| PipelineError::Analysis("daily summary is not a JSON object".to_string()))?;

    let regime = obj.get("marketRegime").and_then(Value::as_str).unwrap_or_default();
    if !MARKET_REGIMES.contains(&regime) {
        return Err(PipelineError::Analysis(format!("invalid marketRegime {regime:?}")));
    }
    let summary = obj.get("summary").and_then(Value::as_str).unwrap_or_default();
    if summary.trim().is_empty() {
        return Err(PipelineError::Analysis("empty daily summary".to_string()));
    }
    Ok(())
}

/// Build and store the summary for `summary_date`, a local day in `offset`.
#[instrument(level = "info", skip(store, analyzer))]
pub async fn build_daily_summary(
    store: &dyn RecordStore,
    analyzer: &dyn Analyzer,
    summary_date: NaiveDate,
    offset: FixedOffset,
) -> Result<SummaryReport> {
    let (start, end) = day_window(summary_date, offset);
    let rows = store.analyses_between(start, end).await?;
    let read = rows.len();

    let usable: Vec<Value> = rows
        .into_iter()
        .filter_map(|row| match validate_analysis(&row.analysis_result) {
            Ok(()) => Some(row.analysis_result),
            Err(e) => {
                debug!(news_id = %row.news_id, error = %e, "Skipping invalid stored analysis");
                None
            }
        })
        .collect();

    let summary = if usable.is_empty() {
        info!(read, "No usable analyses for the day; storing neutral summary");
        empty_day_summary(summary_date)
    } else {
        let mut summary = analyzer.summarize(summary_date, &usable).await?;
        validate_daily_summary(&summary)?;
        if let Some(obj) = summary.as_object_mut() {
            obj.insert("summaryDate".to_string(), json!(summary_date.to_string()));
        }
        summary
    };

    store.save_daily_summary(summary_date, &summary).await?;
    info!(%summary_date, analyzed_count = usable.len(), read, "Daily summary saved");
    Ok(SummaryReport {
        summary_date,
        analyzed_count: usable.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::{ScriptedAnalyzer, sample_analysis};
    use crate::store::memory::MemoryStore;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn may(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, day).unwrap()
    }

    #[test]
    fn test_day_window_in_kst() {
        assert_eq!(day_window(may(6), kst()), (at("2025-05-05T15:00:00Z"), at("2025-05-06T15:00:00Z")));
        assert_eq!(summary_date(at("2025-05-05T15:00:00Z"), kst()), may(6));
        assert_eq!(summary_date(at("2025-05-05T14:59:59Z"), kst()), may(5));
    }

    #[tokio::test]
    async fn test_summary_covers_only_the_local_day() {
        let store = MemoryStore::new();
        let analysis = sample_analysis("t");
        for (id, when) in [
            ("015#before", "2025-05-05T14:59:59Z"),
            ("015#first", "2025-05-05T15:00:00Z"),
            ("015#last", "2025-05-06T14:59:59Z"),
            ("015#after", "2025-05-06T15:00:00Z"),
        ] {
            store.save_analysis(id, &analysis, at(when)).await.unwrap();
        }
        let analyzer = ScriptedAnalyzer::default();

        let report = build_daily_summary(&store, &analyzer, may(6), kst()).await.unwrap();
        assert_eq!(
            report,
            SummaryReport {
                summary_date: may(6),
                analyzed_count: 2
            }
        );
        assert_eq!(*analyzer.summarized.lock().unwrap(), vec![(may(6), 2)]);

        let saved = store.daily_summary(may(6)).await.unwrap();
        assert_eq!(saved["marketRegime"], "risk_on");
        assert_eq!(saved["summaryDate"], "2025-05-06");
    }

    #[tokio::test]
    async fn test_empty_day_stores_neutral_summary() {
        let store = MemoryStore::new();
        let analyzer = ScriptedAnalyzer::default();

        let report = build_daily_summary(&store, &analyzer, may(6), kst()).await.unwrap();
        assert_eq!(report.analyzed_count, 0);
        assert!(analyzer.summarized.lock().unwrap().is_empty());
        assert_eq!(store.daily_summary(may(6)).await, Some(empty_day_summary(may(6))));
    }

    #[tokio::test]
    async fn test_invalid_stored_analyses_are_left_out() {
        let store = MemoryStore::new();
        let when = at("2025-05-06T01:00:00Z");
        store
            .save_analysis("015#bad", &json!({"sentimentLabel": "euphoric"}), when)
            .await
            .unwrap();

        let analyzer = ScriptedAnalyzer::default();
        let report = build_daily_summary(&store, &analyzer, may(6), kst()).await.unwrap();
        assert_eq!(report.analyzed_count, 0);
        assert_eq!(store.daily_summary(may(6)).await.unwrap()["marketRegime"], "neutral");

        store.save_analysis("015#good", &sample_analysis("t"), when).await.unwrap();
        let report = build_daily_summary(&store, &analyzer, may(6), kst()).await.unwrap();
        assert_eq!(report.analyzed_count, 1);
        assert_eq!(store.daily_summary(may(6)).await.unwrap()["marketRegime"], "risk_on");
    }

    #[test]
    fn test_validate_daily_summary() {
        assert!(validate_daily_summary(&empty_day_summary(may(6))).is_ok());
        assert!(validate_daily_summary(&json!({"marketRegime": "euphoria", "summary": "s"})).is_err());
        assert!(validate_daily_summary(&json!({"marketRegime": "risk_off", "summary": ""})).is_err());
    }

    #[test]
    fn test_report_json_shape() {
        let json = serde_json::to_value(SummaryReport {
            summary_date: may(6),
            analyzed_count: 3,
        })
        .unwrap();
        assert_eq!(json, json!({"summaryDate": "2025-05-06", "analyzedCount": 3}));
    }
}
