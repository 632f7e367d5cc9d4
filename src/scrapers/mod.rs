//! Article collection: listing discovery, per-article fetching, and the batch runner.
//!
//! Collection follows a two-phase pattern:
//!
//! 1. **Indexing**: [`collector`] reads one listing page and turns its links into
//!    a deduplicated, bounded list of [`CanonicalItemId`](crate::models::CanonicalItemId)s.
//! 2. **Fetching**: [`batch`] drives a pull-based worker pool over those ids,
//!    each worker fetching through an [`ArticleFetcher`].
//!
//! # Fetcher seams
//!
//! | Trait | Lifetime | Role |
//! |-------|----------|------|
//! | [`ArticleFetcher`] | process | opens one shared session per batch |
//! | [`FetchSession`] | one batch | fetches single articles, each in its own request |
//!
//! [`naver`] is the concrete HTTP implementation. Tests use the scripted
//! fetcher in [`testing`].

use crate::error::{FetchError, PipelineError};
use crate::models::FetchedItem;
use async_trait::async_trait;

pub mod batch;
pub mod collector;
pub mod naver;

/// Source of fetch sessions.
///
/// A batch opens exactly one session, shares it across its workers, and closes
/// it exactly once when every worker has finished.
#[async_trait]
pub trait ArticleFetcher: Send + Sync {
    type Session: FetchSession;

    async fn open_session(&self) -> Result<Self::Session, PipelineError>;
}

/// Shared execution context for one batch.
///
/// Every `fetch_one` call must be isolated from its siblings: a failing or slow
/// article must not affect other in-flight fetches on the same session.
#[async_trait]
pub trait FetchSession: Send + Sync {
    async fn fetch_one(&self, url: &str) -> Result<FetchedItem, FetchError>;

    /// Release the session. Called once per batch, after all fetches settle.
    async fn close(&self);
}
