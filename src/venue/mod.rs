//! Market data and execution boundaries.
//!
//! Defines the `MarketDataProvider` and `ExecutionVenue` traits and ships:
//! - `PaperVenue`: in-memory fills with slippage, for dry runs
//! - `ReplayFeed`: candles from a JSON file or memory
//! - `BinanceFeed`: public klines over REST (read-only)

pub mod binance;
pub mod paper;
pub mod replay;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use crate::types::{Candle, CloseReason, Fill, OrderIntent, Position, Timeframe};

/// Source of candles and the tradable symbol universe.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Most recent `limit` candles, oldest first.
    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>>;

    async fn get_active_symbols(&self) -> Result<Vec<String>>;

    async fn is_healthy(&self) -> bool;
}

/// Where orders go. Implementations own the wire protocol; the engine only
/// sees intents in and fills out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn open_position(&self, intent: &OrderIntent) -> Result<Fill>;

    /// Close the full remaining size.
    async fn close_position(&self, position: &Position, reason: &CloseReason) -> Result<Fill>;

    /// Close `size` units, leaving the rest open.
    async fn reduce_position(&self, position: &Position, size: f64, reason: &CloseReason) -> Result<Fill>;

    async fn is_healthy(&self) -> bool;
}

/// Connectivity notification from a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Lost(String),
    Restored(String),
}

impl ConnectivityEvent {
    pub fn component(&self) -> &str {
        match self {
            ConnectivityEvent::Lost(c) | ConnectivityEvent::Restored(c) => c,
        }
    }
}

impl fmt::Display for ConnectivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityEvent::Lost(c) => write!(f, "connection lost: {c}"),
            ConnectivityEvent::Restored(c) => write!(f, "connection restored: {c}"),
        }
    }
}
