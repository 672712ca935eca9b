//! Strategy engine: indicators, momentum scoring, and risk gating.

pub mod indicators;
pub mod momentum;
pub mod risk;

use tracing::{debug, info, warn};

use crate::types::{CandleSet, SentimentSignal, Signal};
use momentum::{Analysis, MomentumStrategy};
use risk::{RejectionReason, RiskManager};

// ---------------------------------------------------------------------------
// Decision log
// ---------------------------------------------------------------------------

/// Record of every entry decision made (or skipped) for a symbol.
/// Kept for the journal, including setups that were passed on and why.
#[derive(Debug, Clone)]
pub enum DecisionRecord {
    /// Signal approved and sized, ready for execution.
    Selected { signal: Signal, size: f64 },
    /// Technical score below threshold.
    NoSetup { symbol: String, technical_score: f64 },
    /// Sentiment pulled the final score below threshold.
    Filtered {
        symbol: String,
        technical_score: f64,
        sentiment_coefficient: f64,
        final_score: f64,
    },
    /// Signal vetoed by the risk manager.
    RiskRejected {
        signal: Signal,
        reason: RejectionReason,
    },
    /// Sizing returned zero (exposure caps or degenerate stop).
    ZeroSize { signal: Signal },
}

impl DecisionRecord {
    pub fn symbol(&self) -> &str {
        match self {
            DecisionRecord::Selected { signal, .. }
            | DecisionRecord::RiskRejected { signal, .. }
            | DecisionRecord::ZeroSize { signal } => &signal.symbol,
            DecisionRecord::NoSetup { symbol, .. } | DecisionRecord::Filtered { symbol, .. } => symbol,
        }
    }

    pub fn is_selected(&self) -> bool {
        matches!(self, DecisionRecord::Selected { .. })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Pipelines momentum analysis → risk veto → position sizing.
///
/// The risk manager lives here so that the orchestrator mutates it through
/// one owner (`risk_mut`) while entry evaluation only reads it.
pub struct StrategyPipeline {
    strategy: MomentumStrategy,
    risk: RiskManager,
}

impl StrategyPipeline {
    pub fn new(strategy: MomentumStrategy, risk: RiskManager) -> Self {
        Self { strategy, risk }
    }

    pub fn strategy(&self) -> &MomentumStrategy {
        &self.strategy
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn risk_mut(&mut self) -> &mut RiskManager {
        &mut self.risk
    }

    /// Run the entry pipeline for one symbol.
    ///
    /// Steps:
    /// 1. Score the setup and apply the sentiment coefficient.
    /// 2. Ask the risk manager whether a new position is allowed.
    /// 3. Size the position; zero size drops the signal.
    pub fn evaluate(
        &self,
        symbol: &str,
        candles: &CandleSet,
        sentiment: &SentimentSignal,
    ) -> DecisionRecord {
        let signal = match self.strategy.analyze(symbol, candles, sentiment) {
            Analysis::NoSetup { technical_score } => {
                return DecisionRecord::NoSetup {
                    symbol: symbol.to_string(),
                    technical_score,
                };
            }
            Analysis::Filtered {
                technical_score,
                sentiment_coefficient,
                final_score,
            } => {
                return DecisionRecord::Filtered {
                    symbol: symbol.to_string(),
                    technical_score,
                    sentiment_coefficient,
                    final_score,
                };
            }
            Analysis::Entry(signal) => signal,
        };

        if let Err(reason) = self.risk.check_new_position(symbol) {
            warn!(symbol, reason = %reason, "Signal rejected by risk manager");
            return DecisionRecord::RiskRejected { signal, reason };
        }

        let size = self
            .risk
            .calculate_position_size(symbol, signal.entry_price, signal.stop_loss, sentiment);
        if size <= 0.0 {
            debug!(symbol, "Position size is zero, skipping");
            return DecisionRecord::ZeroSize { signal };
        }

        info!(
            symbol,
            side = %signal.side,
            size = format!("{:.6}", size),
            notional = format!("${:.2}", size * signal.entry_price),
            strength = signal.strength,
            "Entry approved"
        );
        DecisionRecord::Selected { signal, size }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
