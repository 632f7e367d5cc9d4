//! Command-line interface definitions for the news ingester.
//!
//! Every option can also be set through the environment variable named in its
//! `env` attribute; flags win over the environment.

use crate::error::Result;
use crate::pipeline::PipelineSettings;
use crate::scheduler::utc_offset;
use crate::scrapers::collector::MAINNEWS_URL;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

/// Scrape finance news into a store and analyze it on a daily schedule.
///
/// # Examples
///
/// ```sh
/// # Scheduler daemon with Supabase and OpenAI (cron schedules, KST)
/// SUPABASE_URL=https://xyz.supabase.co SUPABASE_SERVICE_KEY=... OPENAI_API_KEY=... news_ingest run
///
/// # One scrape, awaited, against the in-memory store
/// news_ingest --limit 5 --concurrency 2 scrape
///
/// # Re-run analysis for records that failed in the last 6 hours
/// news_ingest retry-failed --limit 50 --since-hours 6
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Listing page to collect article links from
    #[arg(long, env = "NEWS_LISTING_URL", default_value = MAINNEWS_URL)]
    pub listing_url: String,

    /// Listing page number
    #[arg(long, env = "NEWS_LISTING_PAGE", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub listing_page: u32,

    /// Maximum number of articles to collect per scrape
    #[arg(long, env = "NEWS_COLLECT_LIMIT", default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..))]
    pub limit: u32,

    /// Concurrent article fetches per scrape
    #[arg(long, env = "NEWS_CONCURRENCY", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub concurrency: u32,

    /// Per-article page timeout in milliseconds
    #[arg(long, env = "NEWS_PAGE_TIMEOUT_MS", default_value_t = 30_000)]
    pub page_timeout_ms: u64,

    /// Records per analysis batch
    #[arg(long, env = "ANALYSIS_BATCH_SIZE", default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..))]
    pub analysis_batch_size: u32,

    /// Chat model used for analysis
    #[arg(long, env = "AI_MODEL", default_value = "gpt-5.2")]
    pub ai_model: String,

    /// OpenAI API key; analysis is unavailable without it
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Supabase project URL; records are kept in memory when unset
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,

    /// Supabase service role key
    #[arg(long, env = "SUPABASE_SERVICE_KEY", hide_env_values = true)]
    pub supabase_service_key: Option<String>,

    /// Scrape schedule, cron expression (`min hour dom month dow`)
    #[arg(long, env = "SCRAPE_SCHEDULE", default_value = "0 9 * * *")]
    pub scrape_schedule: String,

    /// Analysis schedule, cron expression (`min hour dom month dow`)
    #[arg(long, env = "ANALYSIS_SCHEDULE", default_value = "0 10 * * *")]
    pub analysis_schedule: String,

    /// UTC offset in hours for schedules and summary days
    #[arg(long, env = "SCHEDULE_UTC_OFFSET", default_value_t = 9, allow_negative_numbers = true, value_parser = clap::value_parser!(i32).range(-12..=14))]
    pub schedule_utc_offset: i32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daily scrape and analysis schedules until Ctrl-C
    Run,
    /// Collect, fetch, and store one listing page
    Scrape,
    /// Fetch and store a single article URL
    Fetch {
        /// Article URL, e.g. https://n.news.naver.com/mnews/article/015/0005249661
        url: String,
    },
    /// Analyze PENDING records once, then summarize today
    Analyze {
        /// Records to analyze; defaults to the analysis batch size
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        limit: Option<u32>,
    },
    /// Build the daily market summary for one day
    Summarize {
        /// Day to summarize, YYYY-MM-DD; defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Reset recently FAILED records to PENDING and analyze them again
    RetryFailed {
        /// Records to reset
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..=100))]
        limit: u32,
        /// Only records that failed within this many hours
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u32).range(1..=168))]
        since_hours: u32,
    },
    /// Print job state and record counts per status as JSON
    Status,
}

impl Cli {
    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        Ok(PipelineSettings {
            listing_page: self.listing_page,
            collect_limit: self.limit as usize,
            concurrency: self.concurrency as usize,
            analysis_batch_size: self.analysis_batch_size as usize,
            day_offset: utc_offset(self.schedule_utc_offset)?,
        })
    }

    /// Supabase URL and key, when both are set and non-empty.
    pub fn supabase(&self) -> Option<(&str, &str)> {
        let url = self.supabase_url.as_deref().filter(|s| !s.trim().is_empty())?;
        let key = self.supabase_service_key.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((url, key))
    }
}
