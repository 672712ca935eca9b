//! In-memory collaborators for integration testing.
//!
//! `MockMarket` serves candles from a map and `MockVenue` fills every order
//! at the reference price. Both are fully controllable from test code: forced
//! errors, connect failures, health flags, per-symbol close failures and a
//! slow close for cancellation tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use momentum_engine::types::*;
use momentum_engine::venue::{ExecutionVenue, MarketDataProvider};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Alternating 4h bars: `even_move` on even bars, `odd_move` on odd ones.
/// The last bar carries double volume.
pub fn zigzag(n: usize, start: f64, even_move: f64, odd_move: f64) -> Vec<Candle> {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut out = Vec::with_capacity(n);
    let mut prev = start;
    for i in 0..n {
        let mv = if i % 2 == 0 { even_move } else { odd_move };
        let open = prev;
        let close = prev + mv;
        out.push(Candle {
            timestamp: t0 + Duration::hours(4 * i as i64),
            open,
            high: open.max(close) + 0.1,
            low: open.min(close) - 0.1,
            close,
            volume: 1000.0,
        });
        prev = close;
    }
    if let Some(last) = out.last_mut() {
        last.volume = 2000.0;
    }
    out
}

/// Strong uptrend ending at 115.0. Scores a long entry with stop 112.7.
pub fn uptrend() -> Vec<Candle> {
    zigzag(60, 100.0, 1.5, -1.0)
}

/// `series` plus one bar closing at `close`.
pub fn with_last_close(mut series: Vec<Candle>, close: f64) -> Vec<Candle> {
    if let Some(prev) = series.last().copied() {
        series.push(Candle {
            timestamp: prev.timestamp + Duration::hours(4),
            open: prev.close,
            high: prev.close.max(close) + 0.1,
            low: prev.close.min(close) - 0.1,
            close,
            volume: 1000.0,
        });
    }
    series
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Serves `primary` candles per symbol; every other timeframe is missing.
pub struct MockMarket {
    primary: Timeframe,
    candles: Arc<Mutex<HashMap<String, Vec<Candle>>>>,
    symbols: Arc<Mutex<Vec<String>>>,
    healthy: Arc<Mutex<bool>>,
    connect_error: Arc<Mutex<Option<String>>>,
    /// If set, candle and symbol queries return this error.
    force_error: Arc<Mutex<Option<String>>>,
    candle_calls: Arc<Mutex<usize>>,
}

impl MockMarket {
    pub fn new() -> Self {
        Self {
            primary: Timeframe::H4,
            candles: Arc::new(Mutex::new(HashMap::new())),
            symbols: Arc::new(Mutex::new(Vec::new())),
            healthy: Arc::new(Mutex::new(true)),
            connect_error: Arc::new(Mutex::new(None)),
            force_error: Arc::new(Mutex::new(None)),
            candle_calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_symbol(self, symbol: &str, candles: Vec<Candle>) -> Self {
        self.set_candles(symbol, candles);
        self
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        let mut symbols = self.symbols.lock().unwrap();
        if !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
        self.candles.lock().unwrap().insert(symbol.to_string(), candles);
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn fail_connect(&self, msg: &str) {
        *self.connect_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock().unwrap() = healthy;
    }

    pub fn candle_calls(&self) -> usize {
        *self.candle_calls.lock().unwrap()
    }

    fn check_error(&self) -> Result<()> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MarketDataProvider for MockMarket {
    async fn connect(&self) -> Result<()> {
        match self.connect_error.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        *self.candle_calls.lock().unwrap() += 1;
        self.check_error()?;
        if timeframe != self.primary {
            return Err(anyhow!("no {timeframe} data for {symbol}"));
        }
        let candles = self.candles.lock().unwrap();
        let series = candles
            .get(symbol)
            .ok_or_else(|| anyhow!("unknown symbol {symbol}"))?;
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }

    async fn get_active_symbols(&self) -> Result<Vec<String>> {
        self.check_error()?;
        Ok(self.symbols.lock().unwrap().clone())
    }

    async fn is_healthy(&self) -> bool {
        *self.healthy.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Execution venue
// ---------------------------------------------------------------------------

/// Fills at the intent's entry price (opens) or the position's last mark
/// (closes). No fees, no slippage.
pub struct MockVenue {
    fills: Arc<Mutex<Vec<Fill>>>,
    close_attempts: Arc<Mutex<Vec<String>>>,
    fail_close_for: Arc<Mutex<HashSet<String>>>,
    connect_error: Arc<Mutex<Option<String>>>,
    /// If set, every order is rejected with this error.
    force_error: Arc<Mutex<Option<String>>>,
    /// If set, the next close sleeps this long before filling.
    close_delay: Arc<Mutex<Option<StdDuration>>>,
}

impl MockVenue {
    pub fn new() -> Self {
        Self {
            fills: Arc::new(Mutex::new(Vec::new())),
            close_attempts: Arc::new(Mutex::new(Vec::new())),
            fail_close_for: Arc::new(Mutex::new(HashSet::new())),
            connect_error: Arc::new(Mutex::new(None)),
            force_error: Arc::new(Mutex::new(None)),
            close_delay: Arc::new(Mutex::new(None)),
        }
    }

    pub fn slow_next_close(&self, delay: StdDuration) {
        *self.close_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_close(&self, symbol: &str) {
        self.fail_close_for.lock().unwrap().insert(symbol.to_string());
    }

    pub fn fail_connect(&self, msg: &str) {
        *self.connect_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn fills(&self) -> Vec<Fill> {
        self.fills.lock().unwrap().clone()
    }

    /// Symbols of every close attempted, successful or not.
    pub fn close_attempts(&self) -> Vec<String> {
        self.close_attempts.lock().unwrap().clone()
    }

    fn fill(&self, symbol: &str, side: Side, size: f64, price: f64) -> Result<Fill> {
        if let Some(msg) = self.force_error.lock().unwrap().as_ref() {
            return Err(anyhow!("{msg}"));
        }
        let fill = Fill {
            order_id: format!("mock-{}", self.fills.lock().unwrap().len() + 1),
            symbol: symbol.to_string(),
            side,
            size,
            price,
            fees: 0.0,
            timestamp: Utc::now(),
        };
        self.fills.lock().unwrap().push(fill.clone());
        Ok(fill)
    }
}

#[async_trait]
impl ExecutionVenue for MockVenue {
    async fn connect(&self) -> Result<()> {
        match self.connect_error.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn open_position(&self, intent: &OrderIntent) -> Result<Fill> {
        self.fill(&intent.symbol, intent.side, intent.size, intent.entry_price)
    }

    async fn close_position(&self, position: &Position, _reason: &CloseReason) -> Result<Fill> {
        self.close_attempts.lock().unwrap().push(position.symbol.clone());
        let delay = self.close_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_close_for.lock().unwrap().contains(&position.symbol) {
            return Err(anyhow!("venue rejected close for {}", position.symbol));
        }
        self.fill(
            &position.symbol,
            position.side.opposite(),
            position.size,
            position.current_price,
        )
    }

    async fn reduce_position(&self, position: &Position, size: f64, _reason: &CloseReason) -> Result<Fill> {
        self.fill(
            &position.symbol,
            position.side.opposite(),
            size.min(position.size),
            position.current_price,
        )
    }

    async fn is_healthy(&self) -> bool {
        self.connect_error.lock().unwrap().is_none()
    }
}
