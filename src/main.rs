//! # News Ingest
//!
//! Collects finance news articles from a listing page, fetches each article
//! concurrently, stores them in a record store, and runs AI analysis over the
//! stored records, either once from the command line or on a daily schedule.
//!
//! ## Usage
//!
//! ```sh
//! news_ingest run                 # daily schedules until Ctrl-C
//! news_ingest scrape              # one scrape, awaited
//! news_ingest fetch <URL>         # one article
//! news_ingest analyze --limit 10  # one analysis batch, then today's summary
//! news_ingest summarize --date 2025-05-06
//! news_ingest status              # job state and counts per status
//! ```
//!
//! ## Architecture
//!
//! 1. **Collection**: read one listing page into canonical article ids
//! 2. **Fetching**: pull-based worker pool over one shared HTTP session
//! 3. **Ingestion**: idempotent upsert; records start PENDING
//! 4. **Analysis**: claim PENDING -> PROCESSING, analyze, finalize DONE/FAILED
//! 5. **Summary**: roll the day's analyses up into one market summary
//!
//! Scrape and analysis each run under their own single-flight lock.

use clap::Parser;
use reqwest::Client;
use serde::Serialize;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};
use url::Url;

mod analysis;
mod cli;
mod error;
mod ingest;
mod jobs;
mod models;
mod pipeline;
mod scheduler;
mod scrapers;
mod store;
mod utils;

use analysis::Analyzer;
use analysis::openai::{OpenAiAnalyzer, OpenAiConfig};
use cli::{Cli, Command};
use error::PipelineError;
use jobs::TriggerOutcome;
use models::{JobKind, TriggerSource};
use pipeline::Pipeline;
use scheduler::{CronSchedule, spawn_schedule};
use scrapers::collector::ListingCollector;
use scrapers::naver::{FetcherConfig, NaverArticleFetcher};
use store::RecordStore;
use store::memory::MemoryStore;
use store::supabase::SupabaseStore;

const USER_AGENT: &str = concat!("news_ingest/", env!("CARGO_PKG_VERSION"));

fn build_store(args: &Cli) -> Result<Arc<dyn RecordStore>, PipelineError> {
    match args.supabase() {
        Some((url, key)) => {
            let client = Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(30))
                .build()?;
            info!(%url, "Using Supabase record store");
            Ok(Arc::new(SupabaseStore::new(client, url, key)))
        }
        None => {
            warn!("SUPABASE_URL / SUPABASE_SERVICE_KEY not set; records are kept in memory for this process only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_analyzer(args: &Cli) -> Result<Option<Arc<dyn Analyzer>>, PipelineError> {
    let Some(api_key) = args.openai_api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
        warn!("OPENAI_API_KEY not set; analysis runs will fail");
        return Ok(None);
    };
    let analyzer = OpenAiAnalyzer::new(OpenAiConfig {
        api_key: api_key.to_string(),
        model: args.ai_model.clone(),
        base_url: args.openai_base_url.clone(),
        request_timeout: Duration::from_secs(120),
    })?;
    Ok(Some(Arc::new(analyzer)))
}

fn build_pipeline(args: &Cli) -> Result<Pipeline<NaverArticleFetcher>, PipelineError> {
    let listing_url = Url::parse(&args.listing_url)
        .map_err(|e| PipelineError::Config(format!("invalid listing URL {:?}: {e}", args.listing_url)))?;
    let page_timeout = Duration::from_millis(args.page_timeout_ms);
    let listing_client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(page_timeout)
        .build()?;
    let fetcher = NaverArticleFetcher::new(FetcherConfig {
        page_timeout,
        ..Default::default()
    });

    Ok(Pipeline::new(
        ListingCollector::new(listing_client, listing_url),
        fetcher,
        build_store(args)?,
        build_analyzer(args)?,
        args.pipeline_settings()?,
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a triggered job and hand back its result.
async fn finish<T>(kind: JobKind, outcome: TriggerOutcome<T>) -> Result<T, Box<dyn Error>> {
    match outcome {
        TriggerOutcome::Started { handle, .. } => Ok(handle.await??),
        TriggerOutcome::AlreadyRunning { running_since } => {
            Err(format!("{kind} job already running since {running_since:?}").into())
        }
    }
}

#[instrument(level = "info", skip_all)]
async fn run_daemon(pipeline: Arc<Pipeline<NaverArticleFetcher>>, args: &Cli) -> Result<(), Box<dyn Error>> {
    let scrape = CronSchedule::parse(&args.scrape_schedule, args.schedule_utc_offset)?;
    let analysis = CronSchedule::parse(&args.analysis_schedule, args.schedule_utc_offset)?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = vec![
        spawn_schedule(Arc::clone(&pipeline), JobKind::Scrape, scrape, shutdown_tx.subscribe()),
        spawn_schedule(Arc::clone(&pipeline), JobKind::Analysis, analysis, shutdown_tx.subscribe()),
    ];
    info!(
        scrape_schedule = %args.scrape_schedule,
        analysis_schedule = %args.analysis_schedule,
        offset_hours = args.schedule_utc_offset,
        "Scheduler running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }

    let status = pipeline.status().await?;
    if status.scrape.running || status.analysis.running {
        warn!(scrape = status.scrape.running, analysis = status.analysis.running, "Exiting with jobs still running");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    info!(command = ?args.command, "news_ingest starting up");

    let pipeline = Arc::new(build_pipeline(&args)?);

    match args.command.clone() {
        Command::Run => run_daemon(Arc::clone(&pipeline), &args).await?,
        Command::Scrape => print_json(&finish(JobKind::Scrape, pipeline.trigger_scrape(TriggerSource::Manual)).await?)?,
        Command::Fetch { url } => print_json(&pipeline.ingest_single(&url).await?)?,
        Command::Analyze { limit } => {
            let limit = limit.map_or(pipeline.settings().analysis_batch_size, |l| l as usize);
            let outcome = pipeline.trigger_analysis(TriggerSource::Manual, limit);
            print_json(&finish(JobKind::Analysis, outcome).await?)?
        }
        Command::Summarize { date } => {
            let date = date.unwrap_or_else(|| pipeline.today());
            print_json(&pipeline.summarize_day(date).await?)?
        }
        Command::RetryFailed { limit, since_hours } => {
            let outcome = pipeline.trigger_retry_failed(limit as usize, since_hours);
            print_json(&finish(JobKind::Analysis, outcome).await?)?
        }
        Command::Status => print_json(&pipeline.status().await?)?,
    }

    info!(elapsed_ms = start_time.elapsed().as_millis() as u64, "news_ingest finished");
    Ok(())
}
