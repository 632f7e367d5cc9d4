//! Error taxonomy for the ingestion pipeline.
//!
//! Two layers exist:
//! - [`PipelineError`]: errors that reach a job body (listing fetch, store
//!   connectivity, configuration). Job bodies log them and release their lock.
//! - [`FetchError`]: per-article failures. These never leave the batch runner;
//!   they are folded into [`crate::models::FetchFailure`] values.
//!
//! A single-flight rejection is not an error at all, see
//! [`crate::jobs::TriggerOutcome::AlreadyRunning`].

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The listing page could not be fetched or returned a non-success status.
    #[error("listing fetch failed: {0}")]
    ListingFetch(String),

    /// An article URL does not have the `/mnews/article/{office}/{article}` shape.
    #[error("unsupported article url: {0}")]
    InvalidUrlFormat(String),

    #[error("concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    /// The shared fetch session for a batch could not be opened.
    #[error("fetch session unavailable: {0}")]
    Session(String),

    #[error("store operation failed: {0}")]
    Persistence(String),

    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A single-article fetch outside a batch failed.
    #[error("article fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Failure of a single article fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("required element not found: {0}")]
    ElementNotFound(&'static str),

    #[error("unexpected parse failure: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Navigation(format!("request timed out: {e}"))
        } else {
            FetchError::Navigation(e.to_string())
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
