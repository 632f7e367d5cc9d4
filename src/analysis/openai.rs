//! OpenAI chat-completions analyzer with exponential backoff.
//!
//! Each record is sent as one chat request in JSON mode. Transient failures
//! (network, rate limiting, server errors, unparsable output) are retried with
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=250ms)
//! ```
//!
//! Any other HTTP error (bad request, bad key, unknown model) fails on the
//! first attempt. A reply cut off mid-JSON is re-asked once with a request for
//! a shorter answer before it counts as a failed attempt.

use super::Analyzer;
use crate::error::{PipelineError, Result};
use crate::models::ClaimableRecord;
use crate::utils::{looks_truncated, truncate_for_log};
use async_trait::async_trait;
use chrono::NaiveDate;
use rand::{Rng, rng};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

const SYSTEM_PROMPT: &str = "You are a Korean financial news analyst. Return only evidence-based \
structured JSON. This is not investment advice.";

const SCHEMA_HINT: &str = "Respond with one JSON object with keys: sentimentLabel \
(bullish|neutral|bearish), sentimentScore (-1..1), sectors (array of up to 8 strings), \
keywords (3-10 objects with keyword, score 0..1, reason), capitalFlowSignal (object with \
direction inflow|outflow|neutral, participants subset of foreign|institutional|retail, \
rationale), confidence (0..1), summary (string), nextKeywords (3-5 objects with keyword, \
reason, confidence 0..1, followMetrics 1-4 strings).";

const SUMMARY_SYSTEM_PROMPT: &str = "You aggregate Korean stock market news analysis into a \
concise daily market summary. Return JSON only.";

const SUMMARY_SCHEMA_HINT: &str = "Respond with one JSON object with keys: summaryDate \
(YYYY-MM-DD), marketRegime (risk_on|neutral|risk_off), highlights (3-5 strings), topSectors \
(1-5 strings), topKeywords (3-8 strings), nextKeywords (3-5 objects with keyword, reason, \
confidence 0..1, followMetrics 1-4 strings), confidence (0..1), summary (string).";

const SHORTER_HINT: &str = "Your previous answer was cut off. Answer again with the same JSON \
keys but keep every string under 200 characters.";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    /// e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub request_timeout: Duration,
}

/// Backoff between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        self.base_delay.saturating_mul(1 << shift).min(self.max_delay)
    }
}

#[derive(Debug)]
pub struct OpenAiAnalyzer {
    client: Client,
    config: OpenAiConfig,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

enum Reply {
    Parsed(Value),
    Truncated(serde_json::Error),
}

/// A failed attempt, and whether asking again could help.
#[derive(Debug)]
enum AttemptError {
    Transient(PipelineError),
    Permanent(PipelineError),
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        AttemptError::Transient(e.into())
    }
}

/// Rate limiting and server-side failures are worth another attempt.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// The fields of one analysis the daily summary needs.
fn compact_analysis(analysis: &Value) -> Value {
    let names = |key: &str| -> Vec<Value> {
        analysis[key]
            .as_array()
            .map(|items| items.iter().filter_map(|item| item.get("keyword").cloned()).collect())
            .unwrap_or_default()
    };
    json!({
        "sentimentLabel": analysis["sentimentLabel"],
        "sentimentScore": analysis["sentimentScore"],
        "sectors": analysis["sectors"],
        "keywords": names("keywords"),
        "capitalFlowDirection": analysis["capitalFlowSignal"]["direction"],
        "nextKeywords": names("nextKeywords"),
    })
}

impl OpenAiAnalyzer {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PipelineError::Config("OPENAI_API_KEY is required to run analysis".to_string()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build OpenAI HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            retry: RetryPolicy::default(),
        })
    }

    #[cfg(test)]
    fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn prompt(record: &ClaimableRecord) -> String {
        [
            format!("title: {}", record.title),
            format!("published_at: {}", record.published_at),
            "body:".to_string(),
            record.body.clone(),
            String::new(),
            "Extract sentiment, sector trend, text-based capital flow signal, and next keyword ideas."
                .to_string(),
            SCHEMA_HINT.to_string(),
        ]
        .join("\n")
    }

    fn summary_prompt(summary_date: NaiveDate, analyses: &[Value]) -> String {
        let items: Vec<Value> = analyses.iter().map(compact_analysis).collect();
        [
            format!("summary_date: {summary_date}"),
            "analysis_items:".to_string(),
            Value::Array(items).to_string(),
            String::new(),
            "Generate market regime, top sectors/keywords, and next keyword suggestions.".to_string(),
            SUMMARY_SCHEMA_HINT.to_string(),
        ]
        .join("\n")
    }

    fn request_body<'a>(&'a self, system: &'a str, prompt: &'a str, extra: Option<&'a str>) -> ChatRequest<'a> {
        let mut messages = vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: prompt,
            },
        ];
        if let Some(extra) = extra {
            messages.push(ChatMessage {
                role: "user",
                content: extra,
            });
        }
        ChatRequest {
            model: &self.config.model,
            messages,
            response_format: ResponseFormat { kind: "json_object" },
        }
    }

    async fn complete(&self, system: &str, prompt: &str, extra: Option<&str>) -> std::result::Result<Reply, AttemptError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.config.api_key.trim())
            .json(&self.request_body(system, prompt, extra))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            let e = PipelineError::Analysis(format!(
                "OpenAI returned {}: {}",
                status.as_u16(),
                truncate_for_log(&text, 300)
            ));
            return Err(if is_retryable_status(status) {
                AttemptError::Transient(e)
            } else {
                AttemptError::Permanent(e)
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| {
            AttemptError::Transient(PipelineError::Analysis(format!("failed to parse OpenAI response: {e}")))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default();

        match serde_json::from_str::<Value>(&content) {
            Ok(v) => Ok(Reply::Parsed(v)),
            Err(e) if looks_truncated(&e) => Ok(Reply::Truncated(e)),
            Err(e) => Err(AttemptError::Transient(PipelineError::Analysis(format!(
                "model returned invalid JSON ({e}): {}",
                truncate_for_log(&content, 200)
            )))),
        }
    }

    /// One attempt: ask, and re-ask once if the reply was cut off.
    async fn attempt(&self, system: &str, prompt: &str) -> std::result::Result<Value, AttemptError> {
        match self.complete(system, prompt, None).await? {
            Reply::Parsed(v) => Ok(v),
            Reply::Truncated(e) => {
                warn!(error = %e, "Reply truncated; re-asking for a shorter answer");
                match self.complete(system, prompt, Some(SHORTER_HINT)).await? {
                    Reply::Parsed(v) => Ok(v),
                    Reply::Truncated(e) => Err(AttemptError::Transient(PipelineError::Analysis(format!(
                        "reply truncated twice: {e}"
                    )))),
                }
            }
        }
    }

    /// Ask until a reply parses, backing off between transient failures.
    async fn ask(&self, system: &str, prompt: &str) -> Result<Value> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            let e = match self.attempt(system, prompt).await {
                Ok(value) => {
                    info!(
                        attempts = attempt + 1,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        "Model reply received"
                    );
                    return Ok(value);
                }
                Err(AttemptError::Permanent(e)) => {
                    error!(attempt = attempt + 1, error = %e, "Request rejected; not retrying");
                    return Err(e);
                }
                Err(AttemptError::Transient(e)) => e,
            };

            attempt += 1;
            let attempt_dt = attempt_t0.elapsed();
            let total_dt = total_t0.elapsed();

            if attempt > self.retry.max_retries {
                error!(
                    attempt,
                    max = self.retry.max_retries,
                    elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                    elapsed_ms_total = total_dt.as_millis() as u64,
                    error = %e,
                    "ask() exhausted retries"
                );
                return Err(e);
            }

            let jitter_ms: u64 = rng().random_range(0..=250);
            let delay = self.retry.backoff(attempt) + Duration::from_millis(jitter_ms);

            warn!(
                attempt,
                max = self.retry.max_retries,
                elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                elapsed_ms_total = total_dt.as_millis() as u64,
                ?delay,
                error = %e,
                "ask() attempt failed; backing off"
            );
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    #[instrument(level = "info", skip_all, fields(news_id = %record.id, model = %self.config.model))]
    async fn analyze(&self, record: &ClaimableRecord) -> Result<Value> {
        self.ask(SYSTEM_PROMPT, &Self::prompt(record)).await
    }

    #[instrument(level = "info", skip_all, fields(%summary_date, items = analyses.len(), model = %self.config.model))]
    async fn summarize(&self, summary_date: NaiveDate, analyses: &[Value]) -> Result<Value> {
        self.ask(SUMMARY_SYSTEM_PROMPT, &Self::summary_prompt(summary_date, analyses)).await
    }
}
