//! Sentiment source implementations.
//!
//! - `HttpFeedSource`: polls a JSON feed returning either a numeric score
//!   or a list of headlines, which are scored with a keyword lexicon.
//! - `StaticSource`: fixed readings, for paper trading and tests.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::{FeedConfig, SentimentSource};
use crate::config::AppConfig;
use crate::types::SourceKind;

// ---------------------------------------------------------------------------
// Headline scoring
// ---------------------------------------------------------------------------

const BULLISH_WORDS: &[&str] = &[
    "surge", "rally", "breakout", "gain", "rise", "soar", "bull", "adopt",
    "partnership", "launch", "upgrade", "record", "approve", "inflow",
    "accumulate", "growth", "listing",
];

const BEARISH_WORDS: &[&str] = &[
    "crash", "dump", "plunge", "fall", "drop", "bear", "hack", "exploit",
    "lawsuit", "ban", "delist", "outflow", "liquidat", "fraud", "sell-off",
    "decline", "fear",
];

/// Keyword score in [-1, 1]: (bullish - bearish) / (bullish + bearish).
pub fn headline_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }

    let bull = words
        .iter()
        .filter(|w| BULLISH_WORDS.iter().any(|b| w.contains(b)))
        .count() as f64;
    let bear = words
        .iter()
        .filter(|w| BEARISH_WORDS.iter().any(|b| w.contains(b)))
        .count() as f64;

    let denom = bull + bear;
    if denom == 0.0 {
        return 0.0;
    }
    (bull - bear) / denom
}

// ---------------------------------------------------------------------------
// HTTP feed
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    headlines: Vec<String>,
}

fn reading_from(body: &FeedResponse) -> Result<f64> {
    if let Some(score) = body.score {
        return Ok(score);
    }
    if !body.headlines.is_empty() {
        return Ok(headline_score(&body.headlines.join(" ")));
    }
    bail!("Feed returned neither a score nor headlines")
}

/// Sentiment feed over HTTP: `GET {url}?symbol={symbol}`.
pub struct HttpFeedSource {
    kind: SourceKind,
    http: Client,
    url: String,
    api_key: Option<SecretString>,
}

impl HttpFeedSource {
    pub fn new(kind: SourceKind, url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("momentum-engine/0.1.0")
            .build()
            .context("Failed to build sentiment HTTP client")?;
        Ok(Self {
            kind,
            http,
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.map(SecretString::new),
        })
    }

    /// Build from config, resolving the API key from the environment.
    /// A missing key is not fatal; the feed is queried unauthenticated.
    pub fn from_config(feed: &FeedConfig) -> Result<Self> {
        let api_key = feed
            .api_key_env
            .as_deref()
            .and_then(AppConfig::resolve_env);
        Self::new(feed.kind, &feed.url, api_key)
    }
}

#[async_trait]
impl SentimentSource for HttpFeedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}?symbol={}", self.url, urlencoding::encode(symbol));
        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key.expose_secret());
        }

        let body: FeedResponse = req
            .send()
            .await
            .with_context(|| format!("{} feed request failed", self.kind))?
            .error_for_status()
            .with_context(|| format!("{} feed returned an error status", self.kind))?
            .json()
            .await
            .with_context(|| format!("Failed to parse {} feed response", self.kind))?;

        let reading = reading_from(&body)?;
        debug!(symbol, source = %self.kind, reading, "Feed reading");
        Ok(reading)
    }
}

// ---------------------------------------------------------------------------
// Static source
// ---------------------------------------------------------------------------

/// Fixed readings: one default plus optional per-symbol overrides.
#[derive(Debug, Clone)]
pub struct StaticSource {
    kind: SourceKind,
    default: f64,
    per_symbol: HashMap<String, f64>,
}

impl StaticSource {
    pub fn uniform(kind: SourceKind, value: f64) -> Self {
        Self {
            kind,
            default: value,
            per_symbol: HashMap::new(),
        }
    }

    pub fn with_symbol(mut self, symbol: &str, value: f64) -> Self {
        self.per_symbol.insert(symbol.to_string(), value);
        self
    }
}

#[async_trait]
impl SentimentSource for StaticSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, symbol: &str) -> Result<f64> {
        Ok(*self.per_symbol.get(symbol).unwrap_or(&self.default))
    }
}
