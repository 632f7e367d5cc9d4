//! Listing page indexer.
//!
//! Reads one page of the finance "main news" listing and extracts article ids
//! from links shaped like
//! `/news/news_read.naver?article_id=0005249661&office_id=015&mode=mainnews`.
//!
//! Links missing either id, or carrying a non-numeric one, are skipped silently.
//! Output is deduplicated in first-seen order and capped at `limit`.

use crate::error::{PipelineError, Result};
use crate::models::CanonicalItemId;
use itertools::Itertools;
use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument};
use url::Url;

/// Default listing page.
pub const MAINNEWS_URL: &str = "https://finance.naver.com/news/mainnews.naver";

const ARTICLE_LINK_PATH: &str = "/news/news_read.naver";

static ARTICLE_LINK: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"a[href*="news_read.naver"]"#).expect("article link selector")
});

/// Collects canonical article ids from a listing page.
#[derive(Debug, Clone)]
pub struct ListingCollector {
    client: Client,
    listing_url: Url,
}

impl ListingCollector {
    pub fn new(client: Client, listing_url: Url) -> Self {
        Self {
            client,
            listing_url,
        }
    }

    /// The listing URL with its `page` query parameter set, other parameters kept.
    pub fn page_url(&self, page: u32) -> Url {
        let mut url = self.listing_url.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "page")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("page", &page.to_string());
        url
    }

    /// Fetch listing page `page` and return up to `limit` distinct article ids.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ListingFetch`] when the request fails or the response
    /// status is not a success. Finding fewer than `limit` ids (or none) is not
    /// an error.
    #[instrument(level = "info", skip(self))]
    pub async fn collect(&self, page: u32, limit: usize) -> Result<Vec<CanonicalItemId>> {
        let url = self.page_url(page);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PipelineError::ListingFetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::ListingFetch(format!("HTTP {}", status.as_u16())));
        }

        let html = response
            .text()
            .await
            .map_err(|e| PipelineError::ListingFetch(e.to_string()))?;

        let ids = extract_item_ids(&html, &url, limit);
        info!(count = ids.len(), %url, "Collected article ids");
        debug!(ids = ?ids.iter().map(ToString::to_string).collect::<Vec<_>>(), "Listing ids");
        Ok(ids)
    }
}

/// Scan listing markup for article links, resolving relative hrefs against `base`.
///
/// Only links on the listing's own host count; absolute links elsewhere are skipped.
pub fn extract_item_ids(html: &str, base: &Url, limit: usize) -> Vec<CanonicalItemId> {
    let document = Html::parse_document(html);
    document
        .select(&ARTICLE_LINK)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|link| link.host_str() == base.host_str() && link.path() == ARTICLE_LINK_PATH)
        .filter_map(|link| id_from_listing_link(&link))
        .unique()
        .take(limit)
        .collect()
}

fn id_from_listing_link(link: &Url) -> Option<CanonicalItemId> {
    let param = |name: &str| {
        link.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    let office_id = param("office_id")?;
    let article_id = param("article_id")?;
    CanonicalItemId::new(&office_id, &article_id)
}
