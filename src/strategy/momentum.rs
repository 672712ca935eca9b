//! Mid-cap momentum strategy.
//!
//! Scores the primary-timeframe candles on trend alignment, RSI zone,
//! volume expansion, trend strength, and candle structure (0–100). A setup
//! scoring at least `min_score` is scaled by the sentiment coefficient and
//! must clear `min_score` again before it becomes a `Signal`.

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use super::indicators;
use crate::events::{EngineEvent, EventBus};
use crate::types::{
    Candle, CandleSet, Conviction, IndicatorSet, Position, SentimentSignal, Side, Signal,
    TakeProfit, Timeframe,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub strategy_id: String,
    pub min_score: f64,
    pub high_conviction_score: f64,
    pub medium_conviction_score: f64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub adx_period: usize,
    pub volume_lookback: usize,
    pub atr_stop_multiplier: f64,
    /// Minimum stop distance as a fraction of entry.
    pub min_stop_pct: f64,
    pub swing_lookback: usize,
    /// Take-profit distances in multiples of the stop distance.
    pub take_profit_r: Vec<f64>,
    /// Fraction of the initial size closed at each take-profit level.
    pub take_profit_fractions: Vec<f64>,
    pub primary_timeframe: Timeframe,
    pub entry_timeframe: Timeframe,
    pub precision_timeframe: Timeframe,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            strategy_id: "mcrm".to_string(),
            min_score: 75.0,
            high_conviction_score: 90.0,
            medium_conviction_score: 80.0,
            ema_fast: 20,
            ema_slow: 50,
            rsi_period: 14,
            atr_period: 14,
            adx_period: 14,
            volume_lookback: 7,
            atr_stop_multiplier: 2.0,
            min_stop_pct: 0.02,
            swing_lookback: 10,
            take_profit_r: vec![1.5, 3.0, 5.0],
            take_profit_fractions: vec![0.25, 0.35, 0.25],
            primary_timeframe: Timeframe::H4,
            entry_timeframe: Timeframe::H1,
            precision_timeframe: Timeframe::M15,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring output
// ---------------------------------------------------------------------------

/// Points awarded by each scoring component.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoreBreakdown {
    pub trend: f64,
    pub momentum: f64,
    pub volume: f64,
    pub strength: f64,
    pub structure: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.trend + self.momentum + self.volume + self.strength + self.structure
    }
}

/// Outcome of analysing one symbol.
#[derive(Debug, Clone)]
pub enum Analysis {
    /// Technical setup below threshold.
    NoSetup { technical_score: f64 },
    /// Technical setup qualified but sentiment pulled it below threshold.
    Filtered {
        technical_score: f64,
        sentiment_coefficient: f64,
        final_score: f64,
    },
    Entry(Signal),
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// RSI zone points: 40..=65 is the sweet spot, the open bands either side
/// score less, and 30 or below / 75 or above score nothing.
fn rsi_points(rsi: f64) -> f64 {
    if (40.0..=65.0).contains(&rsi) {
        20.0
    } else if rsi > 30.0 && rsi < 40.0 {
        15.0
    } else if rsi > 65.0 && rsi < 75.0 {
        10.0
    } else {
        0.0
    }
}

/// Protective stop at least `min_stop_pct` from entry.
///
/// Long: the tightest of the ATR stop, swing low and minimum-distance stop,
/// then pushed out to at least `min_stop_pct` below entry. Short mirrors.
pub fn protective_stop(
    side: Side,
    entry: f64,
    atr: f64,
    swing: Option<f64>,
    atr_multiplier: f64,
    min_stop_pct: f64,
) -> f64 {
    let min_distance = entry * min_stop_pct;
    match side {
        Side::Long => {
            let atr_stop = entry - atr * atr_multiplier;
            let tightest = swing
                .unwrap_or(f64::NEG_INFINITY)
                .max(atr_stop)
                .max(entry - min_distance);
            tightest.min(entry * (1.0 - min_stop_pct))
        }
        Side::Short => {
            let atr_stop = entry + atr * atr_multiplier;
            let tightest = swing
                .unwrap_or(f64::INFINITY)
                .min(atr_stop)
                .min(entry + min_distance);
            tightest.max(entry * (1.0 + min_stop_pct))
        }
    }
}

/// Take-profit ladder at `r_multiples` of the stop distance.
pub fn take_profit_ladder(
    side: Side,
    entry: f64,
    stop: f64,
    r_multiples: &[f64],
    fractions: &[f64],
) -> Vec<TakeProfit> {
    let distance = (entry - stop).abs();
    r_multiples
        .iter()
        .zip(fractions)
        .map(|(r, fraction)| TakeProfit::new(entry + side.direction() * distance * r, *fraction))
        .collect()
}

/// Lowest low (long) or highest high (short) of the bars before the last.
fn swing_extreme(side: Side, candles: &[Candle], lookback: usize) -> Option<f64> {
    if candles.len() < 2 {
        return None;
    }
    let lookback = lookback.min(candles.len() - 1);
    let window = &candles[candles.len() - 1 - lookback..candles.len() - 1];
    match side {
        Side::Long => window.iter().map(|c| c.low).reduce(f64::min),
        Side::Short => window.iter().map(|c| c.high).reduce(f64::max),
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub struct MomentumStrategy {
    config: MomentumConfig,
    bus: Option<EventBus>,
}

impl MomentumStrategy {
    pub fn new(config: MomentumConfig) -> Self {
        Self { config, bus: None }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &MomentumConfig {
        &self.config
    }

    pub fn strategy_id(&self) -> &str {
        &self.config.strategy_id
    }

    /// Indicator snapshot for a candle series.
    pub fn compute_indicators(&self, candles: &[Candle]) -> IndicatorSet {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let cfg = &self.config;

        IndicatorSet {
            ema_fast: indicators::ema(&closes, cfg.ema_fast),
            ema_slow: indicators::ema(&closes, cfg.ema_slow),
            rsi: indicators::rsi(&closes, cfg.rsi_period),
            atr: indicators::atr(&highs, &lows, &closes, cfg.atr_period),
            adx: indicators::adx(&highs, &lows, &closes, cfg.adx_period),
            volume_ratio: indicators::volume_ratio(&volumes, cfg.volume_lookback),
        }
    }

    /// Score the technical setup. `candles` must not be empty.
    pub fn score(&self, candles: &[Candle], ind: &IndicatorSet) -> ScoreBreakdown {
        let Some(last) = candles.last() else {
            return ScoreBreakdown::default();
        };
        let price = last.close;
        let mut s = ScoreBreakdown::default();

        // Trend alignment
        let bull_aligned = ind.ema_fast > ind.ema_slow && price > ind.ema_fast;
        let bear_aligned = ind.ema_fast < ind.ema_slow && price < ind.ema_fast;
        if bull_aligned || bear_aligned {
            s.trend = 25.0;
        } else if price > ind.ema_fast {
            s.trend = 15.0;
        }

        s.momentum = rsi_points(ind.rsi);

        // Volume expansion
        s.volume = if (1.5..=3.0).contains(&ind.volume_ratio) {
            25.0
        } else if ind.volume_ratio > 3.0 {
            15.0
        } else if ind.volume_ratio >= 1.2 {
            10.0
        } else {
            0.0
        };

        // Trend strength
        s.strength = if ind.adx > 25.0 {
            15.0
        } else if ind.adx > 20.0 {
            10.0
        } else {
            0.0
        };

        // Candle structure
        let range = last.range();
        let body_pct = if range > 0.0 { last.body() / range } else { 0.0 };
        s.structure = if body_pct > 0.5 {
            15.0
        } else if body_pct > 0.3 {
            10.0
        } else {
            0.0
        };

        s
    }

    pub fn conviction_for(&self, final_score: f64) -> Conviction {
        if final_score >= self.config.high_conviction_score {
            Conviction::High
        } else if final_score >= self.config.medium_conviction_score {
            Conviction::Medium
        } else {
            Conviction::Low
        }
    }

    /// Analyse one symbol. Pure apart from event publication.
    pub fn analyze(&self, symbol: &str, candles: &CandleSet, sentiment: &SentimentSignal) -> Analysis {
        let primary = &candles.primary;
        if primary.len() < 2 {
            debug!(symbol, candles = primary.len(), "Not enough candles to score");
            return Analysis::NoSetup { technical_score: 0.0 };
        }

        let ind = self.compute_indicators(primary);
        let technical_score = self.score(primary, &ind).total();
        if technical_score < self.config.min_score {
            debug!(symbol, technical_score, "No setup");
            return Analysis::NoSetup { technical_score };
        }

        let coefficient = sentiment.coefficient;
        let final_score = technical_score * coefficient;
        if final_score < self.config.min_score {
            info!(
                symbol,
                technical_score,
                coefficient = format!("{:.2}", coefficient),
                final_score = format!("{:.1}", final_score),
                "Signal filtered by sentiment"
            );
            self.publish(EngineEvent::SignalFiltered {
                symbol: symbol.to_string(),
                technical_score,
                sentiment_coefficient: coefficient,
                final_score,
            });
            return Analysis::Filtered {
                technical_score,
                sentiment_coefficient: coefficient,
                final_score,
            };
        }

        let side = if ind.ema_fast > ind.ema_slow {
            Side::Long
        } else {
            Side::Short
        };
        let entry_price = primary[primary.len() - 1].close;
        let swing = swing_extreme(side, primary, self.config.swing_lookback);
        let stop_loss = protective_stop(
            side,
            entry_price,
            ind.atr,
            swing,
            self.config.atr_stop_multiplier,
            self.config.min_stop_pct,
        );
        let take_profits = take_profit_ladder(
            side,
            entry_price,
            stop_loss,
            &self.config.take_profit_r,
            &self.config.take_profit_fractions,
        );

        let signal = Signal {
            symbol: symbol.to_string(),
            side,
            entry_price,
            stop_loss,
            take_profits,
            strength: final_score.round().clamp(0.0, 100.0) as u8,
            conviction: self.conviction_for(final_score),
            indicators: ind,
            technical_score,
            sentiment_coefficient: coefficient,
            timestamp: Utc::now(),
        };

        info!(
            symbol,
            side = %signal.side,
            entry = format!("{:.4}", signal.entry_price),
            stop = format!("{:.4}", signal.stop_loss),
            strength = signal.strength,
            conviction = %signal.conviction,
            "Signal generated"
        );
        self.publish(EngineEvent::SignalGenerated {
            symbol: symbol.to_string(),
            side,
            strength: signal.strength,
            conviction: signal.conviction,
        });

        Analysis::Entry(signal)
    }

    /// Trend-reversal exit: the EMAs have crossed against the position and
    /// price has moved through the fast EMA.
    pub fn should_exit(&self, position: &Position, candles: &CandleSet) -> Option<String> {
        if candles.primary.len() < self.config.ema_slow {
            return None;
        }
        let closes: Vec<f64> = candles.primary.iter().map(|c| c.close).collect();
        let fast = indicators::ema(&closes, self.config.ema_fast);
        let slow = indicators::ema(&closes, self.config.ema_slow);
        let price = candles.latest_price()?;

        let reversed = match position.side {
            Side::Long => fast < slow && price < fast,
            Side::Short => fast > slow && price > fast,
        };
        reversed.then(|| {
            format!(
                "trend reversal (ema{} {:.4} vs ema{} {:.4})",
                self.config.ema_fast, fast, self.config.ema_slow, slow
            )
        })
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
