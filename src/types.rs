//! Shared types for the momentum engine.
//!
//! These types form the data model used across all modules.
//! They are kept free of behaviour that needs collaborators so that
//! strategy, sentiment, venue, and engine modules can depend on them
//! without circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// One OHLCV bar. Immutable once produced by a market data provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Absolute size of the candle body.
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// High-to-low range.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Candle granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            Timeframe::M15 => chrono::Duration::minutes(15),
            Timeframe::H1 => chrono::Duration::hours(1),
            Timeframe::H4 => chrono::Duration::hours(4),
            Timeframe::D1 => chrono::Duration::days(1),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            _ => Err(anyhow::anyhow!("Unknown timeframe: {s}")),
        }
    }
}

/// Candles for one symbol across the three analysis timeframes.
///
/// `primary` drives scoring, `entry` and `precision` refine the
/// latest price when available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandleSet {
    pub primary: Vec<Candle>,
    pub entry: Vec<Candle>,
    pub precision: Vec<Candle>,
}

impl CandleSet {
    pub fn new(primary: Vec<Candle>, entry: Vec<Candle>, precision: Vec<Candle>) -> Self {
        Self {
            primary,
            entry,
            precision,
        }
    }

    /// Most recent close, preferring the finest timeframe that has data.
    pub fn latest_price(&self) -> Option<f64> {
        self.precision
            .last()
            .or_else(|| self.entry.last())
            .or_else(|| self.primary.last())
            .map(|c| c.close)
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.entry.is_empty() && self.precision.is_empty()
    }
}

/// Read-only snapshot of the indicators the strategy scored.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub atr: f64,
    pub adx: f64,
    pub volume_ratio: f64,
}

// ---------------------------------------------------------------------------
// Sentiment
// ---------------------------------------------------------------------------

/// The four sentiment inputs, each with a fixed weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Social,
    News,
    OnChain,
    Narrative,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Social,
        SourceKind::News,
        SourceKind::OnChain,
        SourceKind::Narrative,
    ];

    /// Weight of this source in the combined coefficient. Weights sum to 1.
    pub fn weight(&self) -> f64 {
        match self {
            SourceKind::Social => 0.35,
            SourceKind::News => 0.30,
            SourceKind::OnChain => 0.20,
            SourceKind::Narrative => 0.15,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Social => write!(f, "social"),
            SourceKind::News => write!(f, "news"),
            SourceKind::OnChain => write!(f, "on-chain"),
            SourceKind::Narrative => write!(f, "narrative"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "social" => Ok(SourceKind::Social),
            "news" => Ok(SourceKind::News),
            "on_chain" | "onchain" => Ok(SourceKind::OnChain),
            "narrative" => Ok(SourceKind::Narrative),
            _ => Err(anyhow::anyhow!("Unknown sentiment source: {s}")),
        }
    }
}

/// Per-source readings in [-1, 1]. A missing source reads 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceBreakdown {
    pub social: f64,
    pub news: f64,
    pub on_chain: f64,
    pub narrative: f64,
}

impl SourceBreakdown {
    pub fn get(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Social => self.social,
            SourceKind::News => self.news,
            SourceKind::OnChain => self.on_chain,
            SourceKind::Narrative => self.narrative,
        }
    }

    /// Store a reading, clamped to [-1, 1]. Non-finite values read as 0.
    pub fn set(&mut self, kind: SourceKind, value: f64) {
        let value = if value.is_finite() {
            value.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        match kind {
            SourceKind::Social => self.social = value,
            SourceKind::News => self.news = value,
            SourceKind::OnChain => self.on_chain = value,
            SourceKind::Narrative => self.narrative = value,
        }
    }

    pub fn values(&self) -> [f64; 4] {
        [self.social, self.news, self.on_chain, self.narrative]
    }
}

/// Combined market-narrative reading for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentSignal {
    pub symbol: String,
    /// Multiplier applied to the technical score, in [0.5, 1.5].
    pub coefficient: f64,
    /// 0–100, higher when the sources agree.
    pub confidence: f64,
    pub sources: SourceBreakdown,
    pub explanation: String,
    pub last_updated: DateTime<Utc>,
}

impl SentimentSignal {
    /// Neutral reading used when no data exists for a symbol.
    pub fn neutral(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            coefficient: 1.0,
            confidence: 50.0,
            sources: SourceBreakdown::default(),
            explanation: "Default neutral sentiment (no data available)".to_string(),
            last_updated: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short. Multiply a price move by this to get P&L sign.
    pub fn direction(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conviction {
    Low,
    Medium,
    High,
}

impl fmt::Display for Conviction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conviction::Low => write!(f, "low"),
            Conviction::Medium => write!(f, "medium"),
            Conviction::High => write!(f, "high"),
        }
    }
}

/// One rung of the take-profit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfit {
    pub price: f64,
    /// Fraction of the initial size closed at this level.
    pub fraction: f64,
    #[serde(default)]
    pub filled: bool,
}

impl TakeProfit {
    pub fn new(price: f64, fraction: f64) -> Self {
        Self {
            price,
            fraction,
            filled: false,
        }
    }

    /// Whether `price` has reached this level for a position on `side`.
    pub fn is_reached(&self, side: Side, price: f64) -> bool {
        match side {
            Side::Long => price >= self.price,
            Side::Short => price <= self.price,
        }
    }
}

/// An entry recommendation. Consumed once by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    /// Rounded final score, 0–100.
    pub strength: u8,
    pub conviction: Conviction,
    pub indicators: IndicatorSet,
    pub technical_score: f64,
    pub sentiment_coefficient: f64,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// Distance between entry and stop (the "R" unit).
    pub fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @ {:.4} (stop {:.4}, strength {}, {} conviction)",
            self.side, self.symbol, self.entry_price, self.stop_loss, self.strength, self.conviction
        )
    }
}

// ---------------------------------------------------------------------------
// Orders and positions
// ---------------------------------------------------------------------------

/// What the engine asks the execution venue to open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    pub strategy_id: String,
    pub entry_reason: String,
    pub sentiment_coefficient: f64,
    pub technical_score: f64,
}

impl OrderIntent {
    pub fn from_signal(signal: &Signal, size: f64, strategy_id: &str) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            side: signal.side,
            size,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profits: signal.take_profits.clone(),
            strategy_id: strategy_id.to_string(),
            entry_reason: format!(
                "{} conviction momentum (score {})",
                signal.conviction, signal.strength
            ),
            sentiment_coefficient: signal.sentiment_coefficient,
            technical_score: signal.technical_score,
        }
    }

    pub fn notional(&self) -> f64 {
        self.size * self.entry_price
    }
}

/// Venue confirmation of an executed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub fees: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

/// An open or recently closed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub initial_size: f64,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    pub opened_at: DateTime<Utc>,
    pub current_price: f64,
    /// Unrealized P&L on the remaining size.
    pub pnl: f64,
    pub pnl_percent: f64,
    /// P&L already booked by partial exits.
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub venue_ref: String,
    #[serde(default)]
    pub close_attempts: u32,
}

impl Position {
    /// Build a position from the intent that opened it and the venue fill.
    pub fn from_fill(intent: &OrderIntent, fill: &Fill) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            initial_size: fill.size,
            size: fill.size,
            entry_price: fill.price,
            stop_loss: intent.stop_loss,
            take_profits: intent.take_profits.clone(),
            opened_at: fill.timestamp,
            current_price: fill.price,
            pnl: 0.0,
            pnl_percent: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            venue_ref: fill.order_id.clone(),
            close_attempts: 0,
        }
    }

    /// P&L of `size` units if exited at `price`.
    pub fn pnl_at(&self, price: f64, size: f64) -> f64 {
        (price - self.entry_price) * size * self.side.direction()
    }

    /// Re-mark the position at `price`.
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.pnl = self.pnl_at(price, self.size);
        self.pnl_percent = if self.entry_price > 0.0 {
            (price - self.entry_price) / self.entry_price * self.side.direction() * 100.0
        } else {
            0.0
        };
    }

    pub fn notional(&self) -> f64 {
        self.size * self.current_price
    }

    pub fn is_stop_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price <= self.stop_loss,
            Side::Short => price >= self.stop_loss,
        }
    }

    /// Final snapshot of the position as it was closed at `exit_price`.
    pub fn into_closed(mut self, exit_price: f64) -> Self {
        self.mark(exit_price);
        self.status = PositionStatus::Closed;
        self
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.6} @ {:.4} (now {:.4}, P&L ${:.2} / {:+.2}%)",
            self.side,
            self.symbol,
            self.size,
            self.entry_price,
            self.current_price,
            self.pnl,
            self.pnl_percent,
        )
    }
}

/// Why a position (or part of one) was exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    StrategyExit(String),
    EmergencyStop,
    Manual,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::StopLoss => write!(f, "stop loss"),
            CloseReason::TakeProfit => write!(f, "take profit"),
            CloseReason::StrategyExit(why) => write!(f, "strategy exit: {why}"),
            CloseReason::EmergencyStop => write!(f, "emergency stop"),
            CloseReason::Manual => write!(f, "manual"),
        }
    }
}

/// Record of a fully closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Total P&L including earlier partial exits.
    pub pnl: f64,
    pub pnl_percent: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub reason: CloseReason,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Operational snapshot of the engine and its dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub timestamp: DateTime<Utc>,
    pub data_source: bool,
    pub execution_venue: bool,
    pub sentiment_source: bool,
    pub open_position_count: usize,
    pub daily_pnl: f64,
    pub circuit_breaker_active: bool,
    pub recent_errors: Vec<String>,
}

impl SystemHealth {
    pub fn all_healthy(&self) -> bool {
        self.data_source && self.execution_venue && self.sentiment_source
    }

    /// Names of the dependencies currently reporting unhealthy.
    pub fn degraded_components(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.data_source {
            out.push("market_data");
        }
        if !self.execution_venue {
            out.push("execution_venue");
        }
        if !self.sentiment_source {
            out.push("sentiment");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Market data error for {symbol}: {message}")]
    MarketData { symbol: String, message: String },

    #[error("Execution error for {symbol}: {message}")]
    Execution { symbol: String, message: String },

    #[error("Sentiment error: {0}")]
    Sentiment(String),

    #[error("Failed to start {component}: {message}")]
    Startup { component: String, message: String },

    #[error("Invalid transition from {from} on {trigger}")]
    InvalidTransition { from: String, trigger: String },

    #[error("Error budget exhausted after {0} consecutive failed cycles")]
    ErrorBudgetExhausted(u32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
