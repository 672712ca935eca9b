//! Sentiment aggregation.
//!
//! Combines four weighted source readings (social, news, on-chain,
//! narrative) into a coefficient in [0.5, 1.5] that scales the strategy's
//! technical score. Results are cached per symbol and refreshed on their
//! own cadence, so the trading cycle never waits on a slow source.

pub mod sources;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::types::{EngineError, SentimentSignal, SourceBreakdown, SourceKind};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SentimentConfig {
    pub enabled: bool,
    /// Minimum age before a cached snapshot is refreshed.
    pub refresh_interval_secs: u64,
    /// |news reading| at or above this is treated as high-impact news.
    pub high_impact_threshold: f64,
    pub feeds: Vec<FeedConfig>,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 300, // 5 minutes
            high_impact_threshold: 0.8,
            feeds: Vec::new(),
        }
    }
}

/// One configured sentiment feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub kind: SourceKind,
    pub url: String,
    /// Env var holding the API key, if the feed needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// A single sentiment input. Readings are expected in [-1, 1]; anything
/// outside is clamped and non-finite values read as 0.
#[async_trait]
pub trait SentimentSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Verify the source is reachable. Default is a no-op.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, symbol: &str) -> Result<f64>;
}

// ---------------------------------------------------------------------------
// Pure scoring
// ---------------------------------------------------------------------------

/// Weighted combination mapped into [0.5, 1.5].
pub fn combine(sources: &SourceBreakdown) -> f64 {
    let weighted: f64 = SourceKind::ALL
        .iter()
        .map(|k| k.weight() * sources.get(*k).clamp(-1.0, 1.0))
        .sum();
    1.0 + weighted * 0.5
}

/// Agreement between sources: 100 when identical, falling with variance.
pub fn confidence(sources: &SourceBreakdown) -> f64 {
    let values = sources.values();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    ((1.0 - variance).max(0.0) * 100.0).round()
}

/// Human-readable reason naming the dominant source.
pub fn explain(sources: &SourceBreakdown, coefficient: f64) -> String {
    let (dominant, value) = SourceKind::ALL
        .iter()
        .map(|k| (*k, sources.get(*k)))
        .fold((SourceKind::Social, 0.0_f64), |best, cur| {
            if cur.1.abs() > best.1.abs() {
                cur
            } else {
                best
            }
        });

    if value == 0.0 {
        return format!("Neutral narrative ({coefficient:.2}x), no source signal");
    }

    let strength = if coefficient > 1.2 || coefficient < 0.8 {
        "Strong"
    } else {
        "Mild"
    };
    let direction = if coefficient >= 1.0 { "bullish" } else { "bearish" };
    format!("{strength} {direction} narrative ({coefficient:.2}x) driven by {dominant} signal ({value:.2})")
}

/// Build a full signal from a breakdown.
pub fn build_signal(symbol: &str, sources: SourceBreakdown) -> SentimentSignal {
    let coefficient = combine(&sources);
    SentimentSignal {
        symbol: symbol.to_string(),
        coefficient,
        confidence: confidence(&sources),
        explanation: explain(&sources, coefficient),
        sources,
        last_updated: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// High-impact news
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HighImpactNews {
    pub symbol: String,
    pub reading: f64,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

struct CachedSignal {
    signal: SentimentSignal,
    refreshed_at: Instant,
}

/// Per-symbol sentiment cache with background refresh.
///
/// Readers call `get` and always receive a value immediately: the last
/// good snapshot, or neutral when nothing has been fetched yet.
pub struct SentimentAggregator {
    sources: Vec<Arc<dyn SentimentSource>>,
    refresh_interval: Duration,
    high_impact_threshold: f64,
    cache: RwLock<HashMap<String, CachedSignal>>,
    tracked: RwLock<Vec<String>>,
    alerts: Mutex<Vec<HighImpactNews>>,
    last_success: Mutex<Option<Instant>>,
    bus: Option<EventBus>,
}

impl SentimentAggregator {
    pub fn new(config: &SentimentConfig, sources: Vec<Arc<dyn SentimentSource>>) -> Self {
        Self {
            sources,
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            high_impact_threshold: config.high_impact_threshold,
            cache: RwLock::new(HashMap::new()),
            tracked: RwLock::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            last_success: Mutex::new(None),
            bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Connect every configured source. The first failure aborts.
    pub async fn connect(&self) -> Result<()> {
        for source in &self.sources {
            source
                .connect()
                .await
                .with_context(|| format!("Failed to connect {} sentiment source", source.kind()))?;
        }
        info!(sources = self.sources.len(), "Sentiment sources connected");
        Ok(())
    }

    /// Latest snapshot for `symbol`, or neutral if none exists.
    pub fn get(&self, symbol: &str) -> SentimentSignal {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .get(symbol)
            .map(|c| c.signal.clone())
            .unwrap_or_else(|| SentimentSignal::neutral(symbol))
    }

    /// Whether the snapshot for `symbol` is missing or older than the
    /// refresh interval.
    pub fn is_stale(&self, symbol: &str) -> bool {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        match cache.get(symbol) {
            Some(c) => c.refreshed_at.elapsed() > self.refresh_interval,
            None => true,
        }
    }

    /// Replace the set of symbols the background refresher covers.
    pub fn track(&self, symbols: &[String]) {
        let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
        *tracked = symbols.to_vec();
    }

    pub fn tracked(&self) -> Vec<String> {
        self.tracked.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fetch every source for `symbol` concurrently and store the result.
    ///
    /// A failing source contributes 0. If every configured source fails the
    /// cached snapshot is left untouched and an error is returned.
    pub async fn refresh_symbol(&self, symbol: &str) -> Result<SentimentSignal> {
        if self.sources.is_empty() {
            let signal = SentimentSignal::neutral(symbol);
            self.store(symbol, signal.clone());
            return Ok(signal);
        }

        let results = join_all(self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            async move { (source.kind(), source.fetch(symbol).await) }
        }))
        .await;

        let mut sums: HashMap<SourceKind, (f64, u32)> = HashMap::new();
        let mut failures = 0usize;
        for (kind, result) in results {
            match result {
                Ok(value) => {
                    let value = if value.is_finite() { value } else { 0.0 };
                    let entry = sums.entry(kind).or_insert((0.0, 0));
                    entry.0 += value;
                    entry.1 += 1;
                }
                Err(e) => {
                    failures += 1;
                    debug!(symbol, source = %kind, error = %e, "Sentiment source failed");
                }
            }
        }

        if failures == self.sources.len() {
            warn!(
                symbol,
                sources = self.sources.len(),
                "All sentiment sources failed, keeping last snapshot"
            );
            return Err(EngineError::Sentiment(format!(
                "all {} sources failed for {symbol}",
                self.sources.len()
            ))
            .into());
        }

        let mut breakdown = SourceBreakdown::default();
        for (kind, (sum, count)) in sums {
            breakdown.set(kind, sum / count as f64);
        }

        if breakdown.news.abs() >= self.high_impact_threshold {
            self.flag_high_impact(symbol, breakdown.news);
        }

        let signal = build_signal(symbol, breakdown);
        debug!(
            symbol,
            coefficient = format!("{:.3}", signal.coefficient),
            confidence = signal.confidence,
            failed_sources = failures,
            "Sentiment refreshed"
        );
        self.store(symbol, signal.clone());
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        Ok(signal)
    }

    /// Refresh each of `symbols` whose snapshot is stale. Returns how many
    /// were refreshed successfully.
    pub async fn refresh_stale(&self, symbols: &[String]) -> usize {
        let mut refreshed = 0;
        for symbol in symbols {
            if !self.is_stale(symbol) {
                continue;
            }
            if self.refresh_symbol(symbol).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Drain queued high-impact news alerts.
    pub fn take_high_impact(&self) -> Vec<HighImpactNews> {
        std::mem::take(&mut *self.alerts.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Healthy when unconfigured, not yet refreshed, or refreshed
    /// successfully within three refresh intervals.
    pub fn is_healthy(&self) -> bool {
        if self.sources.is_empty() {
            return true;
        }
        let last = *self.last_success.lock().unwrap_or_else(|e| e.into_inner());
        match last {
            Some(at) => at.elapsed() <= self.refresh_interval * 3,
            None => {
                let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
                cache.is_empty()
            }
        }
    }

    /// Run stale refreshes for the tracked symbols on a detached task until
    /// `shutdown` flips to true or its sender is dropped.
    pub fn spawn_refresher(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(every_secs = every.as_secs(), "Sentiment refresher started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let symbols = self.tracked();
                        let refreshed = self.refresh_stale(&symbols).await;
                        debug!(refreshed, tracked = symbols.len(), "Sentiment refresh pass");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sentiment refresher stopped");
        })
    }

    fn store(&self, symbol: &str, signal: SentimentSignal) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            symbol.to_string(),
            CachedSignal {
                signal,
                refreshed_at: Instant::now(),
            },
        );
    }

    fn flag_high_impact(&self, symbol: &str, reading: f64) {
        warn!(symbol, reading = format!("{:.2}", reading), "High impact news detected");
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(HighImpactNews {
                symbol: symbol.to_string(),
                reading,
                detected_at: Utc::now(),
            });
        if let Some(bus) = &self.bus {
            bus.publish(EngineEvent::HighImpactNews {
                symbol: symbol.to_string(),
                reading,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
