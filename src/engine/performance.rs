//! Performance tracker: realized P&L, daily stats, drawdown.
//!
//! Money sums are kept in `Decimal` so that long runs of small trades do not
//! drift. Positions and prices stay `f64`; conversion happens at the edge.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::types::ClosedTrade;

/// Trades beyond these percentages are flagged as notable.
const NOTABLE_WIN_PCT: f64 = 10.0;
const NOTABLE_LOSS_PCT: f64 = -5.0;

fn to_decimal(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or(Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Daily stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub gross_profit: Decimal,
    /// Sum of losing trades, as a positive amount.
    pub gross_loss: Decimal,
    pub net: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
}

impl DailyStats {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            trades: 0,
            wins: 0,
            losses: 0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            net: Decimal::ZERO,
            largest_win: Decimal::ZERO,
            largest_loss: Decimal::ZERO,
        }
    }

    fn record(&mut self, pnl: Decimal) {
        self.trades += 1;
        self.net += pnl;
        if pnl > Decimal::ZERO {
            self.wins += 1;
            self.gross_profit += pnl;
            self.largest_win = self.largest_win.max(pnl);
        } else {
            self.losses += 1;
            self.gross_loss += -pnl;
            self.largest_loss = self.largest_loss.min(pnl);
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    /// 0–1.
    pub win_rate: f64,
    /// Gross profit over gross loss. `None` with no losing trades.
    pub profit_factor: Option<f64>,
    pub realized_pnl: Decimal,
    pub equity: Decimal,
    pub peak_equity: Decimal,
    /// 0–1, measured on marked equity.
    pub max_drawdown: f64,
    pub today: Option<DailyStats>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct PerformanceTracker {
    initial_equity: Decimal,
    realized: Decimal,
    unrealized: Decimal,
    peak_equity: Decimal,
    max_drawdown: Decimal,
    wins: u32,
    losses: u32,
    gross_profit: Decimal,
    gross_loss: Decimal,
    days: BTreeMap<NaiveDate, DailyStats>,
}

impl PerformanceTracker {
    pub fn new(initial_equity: f64) -> Self {
        let initial = to_decimal(initial_equity);
        Self {
            initial_equity: initial,
            realized: Decimal::ZERO,
            unrealized: Decimal::ZERO,
            peak_equity: initial,
            max_drawdown: Decimal::ZERO,
            wins: 0,
            losses: 0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            days: BTreeMap::new(),
        }
    }

    /// Record a fully closed trade. Its P&L includes earlier partial exits,
    /// so partials are not recorded separately here.
    pub fn record_trade(&mut self, trade: &ClosedTrade) {
        let pnl = to_decimal(trade.pnl);
        self.realized += pnl;
        if pnl > Decimal::ZERO {
            self.wins += 1;
            self.gross_profit += pnl;
        } else {
            self.losses += 1;
            self.gross_loss += -pnl;
        }
        self.days
            .entry(trade.closed_at.date_naive())
            .or_insert_with(|| DailyStats::new(trade.closed_at.date_naive()))
            .record(pnl);

        if Self::is_notable(trade) {
            warn!(
                symbol = %trade.symbol,
                pnl = format!("${:.2}", trade.pnl),
                pnl_percent = format!("{:+.2}%", trade.pnl_percent),
                "Notable trade result"
            );
        }
        self.refresh_drawdown();
    }

    /// Re-mark open positions. Drawdown is measured on marked equity.
    pub fn mark_unrealized(&mut self, unrealized: f64) {
        self.unrealized = to_decimal(unrealized);
        self.refresh_drawdown();
    }

    fn refresh_drawdown(&mut self) {
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        if self.peak_equity > Decimal::ZERO {
            let dd = (self.peak_equity - equity) / self.peak_equity;
            if dd > self.max_drawdown {
                self.max_drawdown = dd;
            }
        }
    }

    pub fn equity(&self) -> Decimal {
        self.initial_equity + self.realized + self.unrealized
    }

    pub fn realized(&self) -> Decimal {
        self.realized
    }

    pub fn daily(&self, date: NaiveDate) -> Option<&DailyStats> {
        self.days.get(&date)
    }

    pub fn is_notable(trade: &ClosedTrade) -> bool {
        trade.pnl_percent > NOTABLE_WIN_PCT || trade.pnl_percent < NOTABLE_LOSS_PCT
    }

    pub fn summary(&self, now: DateTime<Utc>) -> PerformanceSummary {
        let total = self.wins + self.losses;
        let win_rate = if total > 0 {
            self.wins as f64 / total as f64
        } else {
            0.0
        };
        let profit_factor = if self.gross_loss > Decimal::ZERO {
            (self.gross_profit / self.gross_loss).to_f64()
        } else {
            None
        };
        PerformanceSummary {
            total_trades: total,
            wins: self.wins,
            losses: self.losses,
            win_rate,
            profit_factor,
            realized_pnl: self.realized,
            equity: self.equity(),
            peak_equity: self.peak_equity,
            max_drawdown: self.max_drawdown.to_f64().unwrap_or(0.0),
            today: self.days.get(&now.date_naive()).cloned(),
        }
    }

    /// Log a one-line summary; called once per cycle.
    pub fn log_summary(&self, now: DateTime<Utc>) {
        let s = self.summary(now);
        info!(
            trades = s.total_trades,
            win_rate = format!("{:.1}%", s.win_rate * 100.0),
            realized = format!("${:.2}", s.realized_pnl),
            equity = format!("${:.2}", s.equity),
            max_drawdown = format!("{:.2}%", s.max_drawdown * 100.0),
            "Performance"
        );
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(10_000.0)
    }
}
