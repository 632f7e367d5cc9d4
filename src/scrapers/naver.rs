//! Naver News article fetcher.
//!
//! Fetches article pages such as
//! `https://n.news.naver.com/mnews/article/015/0005249661` over plain HTTP and
//! extracts title, body, and publication timestamp from the server-rendered
//! markup.
//!
//! One [`reqwest::Client`] (connection pool, TLS state) is built per batch and
//! shared by its workers; every article is its own request with its own
//! deadline, so a stuck page only costs its own worker.

use super::{ArticleFetcher, FetchSession};
use crate::error::{FetchError, PipelineError};
use crate::models::FetchedItem;
use crate::utils::{normalize_multiline, normalize_single_line};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::{debug, info, instrument};

const USER_AGENT: &str = concat!("news_ingest/", env!("CARGO_PKG_VERSION"));

/// Marker element every article page renders; its absence means the page is
/// not an article (removed, age-gated, or an error page).
const BODY_MARKER: &str = "#dic_area";

fn selectors(list: &[&str]) -> Vec<Selector> {
    list.iter()
        .map(|s| Selector::parse(s).expect("article selector"))
        .collect()
}

static TITLE: Lazy<Vec<Selector>> =
    Lazy::new(|| selectors(&["#title_area > span", "#title_area", ".media_end_head_headline"]));
static BODY: Lazy<Vec<Selector>> =
    Lazy::new(|| selectors(&["#dic_area", "article#dic_area", ".go_trans._article_content"]));
static PUBLISHED_AT: Lazy<Vec<Selector>> = Lazy::new(|| {
    selectors(&[
        ".media_end_head_info_datestamp_time._ARTICLE_DATE_TIME",
        ".media_end_head_info_datestamp_time",
        "span._ARTICLE_DATE_TIME",
    ])
});
static BODY_MARKER_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(BODY_MARKER).expect("body marker selector"));
static DOCUMENT_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("title selector"));

/// Settings for [`NaverArticleFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Deadline for one article: request, redirects, and body download.
    pub page_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(15_000),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NaverArticleFetcher {
    config: FetcherConfig,
}

impl NaverArticleFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }
}

/// One batch's HTTP session.
#[derive(Debug)]
pub struct NaverSession {
    client: Client,
    page_timeout: Duration,
}

#[async_trait]
impl ArticleFetcher for NaverArticleFetcher {
    type Session = NaverSession;

    async fn open_session(&self) -> Result<NaverSession, PipelineError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(self.config.connect_timeout)
            .build()
            .map_err(|e| PipelineError::Session(e.to_string()))?;
        debug!(page_timeout_ms = self.config.page_timeout.as_millis() as u64, "Opened fetch session");
        Ok(NaverSession {
            client,
            page_timeout: self.config.page_timeout,
        })
    }
}

#[async_trait]
impl FetchSession for NaverSession {
    #[instrument(level = "debug", skip(self))]
    async fn fetch_one(&self, url: &str) -> Result<FetchedItem, FetchError> {
        let request = async {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Navigation(format!("HTTP {}", status.as_u16())));
            }
            let final_url = response.url().to_string();
            let html = response.text().await?;
            Ok((final_url, html))
        };

        let (final_url, html) = tokio::time::timeout(self.page_timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(self.page_timeout))??;

        let item = parse_article(&final_url, &html)?;
        info!(url = %item.url, bytes = item.body.len(), "Parsed article");
        Ok(item)
    }

    async fn close(&self) {
        debug!("Closed fetch session");
    }
}

/// Extract an article from its page markup.
///
/// Fails only when the body marker element is missing; any other field that
/// cannot be located comes back as an empty string.
pub fn parse_article(url: &str, html: &str) -> Result<FetchedItem, FetchError> {
    let document = Html::parse_document(html);

    if document.select(&BODY_MARKER_SELECTOR).next().is_none() {
        return Err(FetchError::ElementNotFound(BODY_MARKER));
    }

    let title = first_text(&document, &TITLE, false);
    let title = if title.is_empty() {
        document
            .select(&DOCUMENT_TITLE)
            .next()
            .map(|t| normalize_single_line(&element_text(t)))
            .unwrap_or_default()
    } else {
        title
    };

    Ok(FetchedItem {
        url: url.to_string(),
        title,
        body: first_text(&document, &BODY, true),
        published_at: published_at(&document),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join("")
}

fn first_text(document: &Html, selectors: &[Selector], multiline: bool) -> String {
    for selector in selectors {
        let Some(element) = document.select(selector).next() else {
            continue;
        };
        let raw = element_text(element);
        let text = if multiline {
            normalize_multiline(&raw)
        } else {
            normalize_single_line(&raw)
        };
        if !text.is_empty() {
            return text;
        }
    }
    String::new()
}

fn published_at(document: &Html) -> String {
    for selector in PUBLISHED_AT.iter() {
        let Some(element) = document.select(selector).next() else {
            continue;
        };
        if let Some(stamp) = element.value().attr("data-date-time") {
            let stamp = normalize_single_line(stamp);
            if !stamp.is_empty() {
                return stamp;
            }
        }
        let text = normalize_single_line(&element_text(element));
        if !text.is_empty() {
            return text;
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::testing::serve_http;

    const URL: &str = "https://n.news.naver.com/mnews/article/015/0005249661";

    fn article_page() -> &'static str {
        r#"<html>
          <head><title>Fallback Title : 네이버 뉴스</title></head>
          <body>
            <h2 id="title_area"><span>  Chip   exports hit record </span></h2>
            <span class="media_end_head_info_datestamp_time _ARTICLE_DATE_TIME"
                  data-date-time="2025-05-06 09:31:12">2025.05.06. 오전 9:31</span>
            <article id="dic_area">
              First paragraph.&nbsp;

              <br>   Second paragraph.
            </article>
          </body>
        </html>"#
    }

    #[test]
    fn test_parse_article_fields() {
        let item = parse_article(URL, article_page()).unwrap();
        assert_eq!(item.url, URL);
        assert_eq!(item.title, "Chip exports hit record");
        assert_eq!(item.published_at, "2025-05-06 09:31:12");
        assert_eq!(item.body, "First paragraph.\nSecond paragraph.");
    }

    #[test]
    fn test_missing_body_marker_is_failure() {
        let html = "<html><head><title>Not found</title></head><body><p>gone</p></body></html>";
        let err = parse_article(URL, html).unwrap_err();
        assert!(matches!(err, FetchError::ElementNotFound("#dic_area")));
    }

    #[test]
    fn test_missing_fields_are_empty_not_errors() {
        let html = r#"<html><body><div id="dic_area">Only a body</div></body></html>"#;
        let item = parse_article(URL, html).unwrap();
        assert_eq!(item.title, "");
        assert_eq!(item.published_at, "");
        assert_eq!(item.body, "Only a body");
    }

    #[test]
    fn test_title_falls_back_to_document_title() {
        let html = r#"<html><head><title> Fallback   Title </title></head>
            <body><div id="dic_area">text</div></body></html>"#;
        let item = parse_article(URL, html).unwrap();
        assert_eq!(item.title, "Fallback Title");
    }

    #[test]
    fn test_published_at_uses_text_without_attribute() {
        let html = r#"<html><body>
            <span class="media_end_head_info_datestamp_time">2025.05.06. 오전 9:31</span>
            <div id="dic_area">text</div></body></html>"#;
        let item = parse_article(URL, html).unwrap();
        assert_eq!(item.published_at, "2025.05.06. 오전 9:31");
    }

    #[tokio::test]
    async fn test_fetch_one_over_http() {
        let server = serve_http(200, article_page()).await;
        let fetcher = NaverArticleFetcher::default();
        let session = fetcher.open_session().await.unwrap();
        let url = format!("{}/mnews/article/015/0005249661", server.base_url);

        let item = session.fetch_one(&url).await.unwrap();
        assert_eq!(item.url, url);
        assert_eq!(item.title, "Chip exports hit record");
        session.close().await;
    }

    #[tokio::test]
    async fn test_fetch_one_non_success_is_navigation_error() {
        let server = serve_http(404, "missing").await;
        let session = NaverArticleFetcher::default().open_session().await.unwrap();
        let err = session
            .fetch_one(&format!("{}/mnews/article/015/1", server.base_url))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Navigation(ref m) if m == "HTTP 404"), "{err}");
    }
}
