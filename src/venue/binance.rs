//! Binance public market data over REST.
//!
//! API: `GET /api/v3/klines?symbol=..&interval=..&limit=..`
//! Auth: none (public endpoint). Read-only; order placement is not wired.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::MarketDataProvider;
use crate::types::{Candle, Timeframe};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
/// Exchange cap on klines per request.
const MAX_LIMIT: usize = 1000;

pub struct BinanceFeed {
    http: Client,
    base_url: String,
    symbols: Vec<String>,
    healthy: AtomicBool,
}

impl BinanceFeed {
    pub fn new(base_url: Option<&str>, symbols: Vec<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("momentum-engine/0.1.0")
            .build()
            .context("Failed to build Binance HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            symbols,
            healthy: AtomicBool::new(false),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.http
            .get(format!("{}/api/v3/ping", self.base_url))
            .send()
            .await
            .context("Binance ping failed")?
            .error_for_status()
            .context("Binance ping returned an error status")?;
        Ok(())
    }
}

/// Parse the klines array-of-arrays payload. Numeric fields arrive as strings.
pub fn parse_klines(payload: &Value) -> Result<Vec<Candle>> {
    let rows = payload
        .as_array()
        .ok_or_else(|| anyhow!("Klines payload is not an array"))?;

    rows.iter()
        .map(|row| {
            let row = row
                .as_array()
                .ok_or_else(|| anyhow!("Kline row is not an array"))?;
            if row.len() < 6 {
                bail!("Kline row has {} fields, expected at least 6", row.len());
            }
            let open_time = row[0]
                .as_i64()
                .ok_or_else(|| anyhow!("Kline open time is not an integer"))?;
            let timestamp = DateTime::<Utc>::from_timestamp_millis(open_time)
                .ok_or_else(|| anyhow!("Kline open time out of range: {open_time}"))?;
            let num = |i: usize| -> Result<f64> {
                match &row[i] {
                    Value::String(s) => s
                        .parse::<f64>()
                        .with_context(|| format!("Bad numeric field {i}: {s}")),
                    Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("Bad numeric field {i}")),
                    other => Err(anyhow!("Unexpected kline field {i}: {other}")),
                }
            };
            Ok(Candle {
                timestamp,
                open: num(1)?,
                high: num(2)?,
                low: num(3)?,
                close: num(4)?,
                volume: num(5)?,
            })
        })
        .collect()
}

#[async_trait]
impl MarketDataProvider for BinanceFeed {
    async fn connect(&self) -> Result<()> {
        self.ping().await?;
        self.healthy.store(true, Ordering::SeqCst);
        info!(base_url = %self.base_url, symbols = self.symbols.len(), "Binance feed connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.healthy.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            urlencoding::encode(symbol),
            timeframe.as_str(),
            limit.clamp(1, MAX_LIMIT)
        );
        let resp = self.http.get(&url).send().await;
        let payload: Value = match resp {
            Ok(r) => r
                .error_for_status()
                .with_context(|| format!("Klines request for {symbol} rejected"))?
                .json()
                .await
                .with_context(|| format!("Failed to decode klines for {symbol}"))?,
            Err(e) => {
                self.healthy.store(false, Ordering::SeqCst);
                warn!(symbol, error = %e, "Klines request failed");
                return Err(e).context("Klines request failed");
            }
        };
        self.healthy.store(true, Ordering::SeqCst);

        let candles = parse_klines(&payload)?;
        debug!(symbol, timeframe = %timeframe, count = candles.len(), "Klines fetched");
        Ok(candles)
    }

    async fn get_active_symbols(&self) -> Result<Vec<String>> {
        Ok(self.symbols.clone())
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
