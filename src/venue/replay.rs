//! Replay market data feed.
//!
//! Serves candles held in memory, optionally loaded from a JSON file shaped
//! as `{ "SOLUSDT": { "4h": [candles], "1h": [...], "15m": [...] } }`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use super::MarketDataProvider;
use crate::types::{Candle, Timeframe};

type FileLayout = HashMap<String, HashMap<String, Vec<Candle>>>;

pub struct ReplayFeed {
    candles: HashMap<(String, Timeframe), Vec<Candle>>,
    symbols: Vec<String>,
    connected: AtomicBool,
}

impl ReplayFeed {
    pub fn new() -> Self {
        Self {
            candles: HashMap::new(),
            symbols: Vec::new(),
            connected: AtomicBool::new(false),
        }
    }

    /// Add (or replace) a series. The symbol joins the active universe.
    pub fn with_series(mut self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) -> Self {
        if !self.symbols.iter().any(|s| s == symbol) {
            self.symbols.push(symbol.to_string());
        }
        self.candles.insert((symbol.to_string(), timeframe), candles);
        self
    }

    /// Load every series from a JSON file.
    pub fn from_file(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(anyhow!("Replay file not found: {path}"));
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay file {path}"))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse replay file {path}"))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let layout: FileLayout = serde_json::from_str(json)?;
        let mut feed = Self::new();
        let mut symbols: Vec<&String> = layout.keys().collect();
        symbols.sort();
        for symbol in symbols {
            for (tf, candles) in &layout[symbol] {
                let timeframe: Timeframe = tf.parse()?;
                feed = feed.with_series(symbol, timeframe, candles.clone());
            }
        }
        Ok(feed)
    }
}

impl Default for ReplayFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for ReplayFeed {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!(symbols = self.symbols.len(), series = self.candles.len(), "Replay feed connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let series = self
            .candles
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| anyhow!("No {timeframe} replay data for {symbol}"))?;
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }

    async fn get_active_symbols(&self) -> Result<Vec<String>> {
        Ok(self.symbols.clone())
    }

    async fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
