//! Position manager.
//!
//! Owns every open position (at most one per symbol) and the closed-trade
//! history. Exit rules are evaluated here but executed by the orchestrator,
//! which reports back through `apply_partial`, `close` or `abort_close`.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::storage;
use crate::strategy::risk::Exposure;
use crate::types::{
    ClosedTrade, CloseReason, EngineError, Fill, OrderIntent, Position, PositionStatus,
};

/// Closed trades kept in memory.
const MAX_HISTORY: usize = 500;
/// Size tolerance when deciding whether a partial exit empties a position.
const SIZE_EPSILON: f64 = 1e-9;

/// What to do with an open position this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDecision {
    Hold,
    /// Reduce by `size` to fill the take-profit rungs at `levels`.
    Partial { levels: Vec<usize>, size: f64 },
    Close(CloseReason),
}

pub struct PositionManager {
    open: HashMap<String, Position>,
    closed: Vec<ClosedTrade>,
    persist_path: Option<String>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            open: HashMap::new(),
            closed: Vec::new(),
            persist_path: None,
        }
    }

    /// Snapshot open positions to `path` after every change.
    pub fn with_persistence(mut self, path: &str) -> Self {
        self.persist_path = Some(path.to_string());
        self
    }

    pub fn persist_path(&self) -> Option<&str> {
        self.persist_path.as_deref()
    }

    // -- Queries -------------------------------------------------------------

    pub fn has_position(&self, symbol: &str) -> bool {
        self.open.contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.open.get(symbol)
    }

    /// Open positions, oldest first.
    pub fn get_active_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self.open.values().cloned().collect();
        out.sort_by_key(|p| p.opened_at);
        out
    }

    pub fn symbols(&self) -> Vec<String> {
        self.get_active_positions().into_iter().map(|p| p.symbol).collect()
    }

    pub fn active_count(&self) -> usize {
        self.open.len()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.open.values().map(|p| p.pnl).sum()
    }

    /// Realized P&L: closed trades plus partial exits of still-open positions.
    pub fn realized_pnl(&self) -> f64 {
        self.closed.iter().map(|t| t.pnl).sum::<f64>()
            + self.open.values().map(|p| p.realized_pnl).sum::<f64>()
    }

    pub fn get_total_pnl(&self) -> f64 {
        self.realized_pnl() + self.unrealized_pnl()
    }

    /// P&L of positions still open, partial exits included.
    pub fn open_pnl(&self) -> f64 {
        self.open.values().map(|p| p.pnl + p.realized_pnl).sum()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn exposure(&self) -> Exposure {
        Exposure {
            by_symbol: self
                .open
                .values()
                .map(|p| (p.symbol.clone(), p.notional()))
                .collect(),
        }
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Record a filled entry. A second position on the same symbol is refused.
    pub fn open(&mut self, intent: &OrderIntent, fill: &Fill) -> Result<Position, EngineError> {
        if self.has_position(&intent.symbol) {
            return Err(EngineError::Execution {
                symbol: intent.symbol.clone(),
                message: "position already open".to_string(),
            });
        }
        let position = Position::from_fill(intent, fill);
        info!(
            symbol = %position.symbol,
            side = %position.side,
            size = format!("{:.6}", position.size),
            entry = format!("{:.4}", position.entry_price),
            stop = format!("{:.4}", position.stop_loss),
            "Position opened"
        );
        self.open.insert(position.symbol.clone(), position.clone());
        self.persist();
        Ok(position)
    }

    /// Adopt positions loaded from disk. Duplicates and closed entries are skipped.
    pub fn restore(&mut self, positions: Vec<Position>) -> usize {
        let mut restored = 0;
        for mut p in positions {
            if p.status == PositionStatus::Closed || self.has_position(&p.symbol) {
                warn!(symbol = %p.symbol, "Skipping restored position");
                continue;
            }
            // A close in flight at shutdown is retried from Open.
            p.status = PositionStatus::Open;
            self.open.insert(p.symbol.clone(), p);
            restored += 1;
        }
        if restored > 0 {
            info!(count = restored, "Positions restored");
        }
        restored
    }

    /// Re-mark positions that have a price. Returns how many were updated.
    pub fn update_positions(&mut self, prices: &HashMap<String, f64>) -> usize {
        let mut updated = 0;
        for (symbol, position) in self.open.iter_mut() {
            if let Some(&price) = prices.get(symbol) {
                if price.is_finite() && price > 0.0 {
                    position.mark(price);
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Stop and take-profit rules at the position's current mark.
    pub fn evaluate_exit(&self, position: &Position) -> ExitDecision {
        if position.status != PositionStatus::Open {
            return ExitDecision::Hold;
        }
        let price = position.current_price;
        if position.is_stop_hit(price) {
            return ExitDecision::Close(CloseReason::StopLoss);
        }

        let levels: Vec<usize> = position
            .take_profits
            .iter()
            .enumerate()
            .filter(|(_, tp)| !tp.filled && tp.is_reached(position.side, price))
            .map(|(i, _)| i)
            .collect();
        if levels.is_empty() {
            return ExitDecision::Hold;
        }

        let fraction: f64 = levels.iter().map(|&i| position.take_profits[i].fraction).sum();
        let size = (fraction * position.initial_size).min(position.size);
        if size >= position.size - SIZE_EPSILON {
            ExitDecision::Close(CloseReason::TakeProfit)
        } else {
            ExitDecision::Partial { levels, size }
        }
    }

    /// Mark a position as closing. `None` if it is unknown or already closing.
    pub fn begin_close(&mut self, symbol: &str) -> Option<Position> {
        let position = self.open.get_mut(symbol)?;
        if position.status != PositionStatus::Open {
            return None;
        }
        position.status = PositionStatus::Closing;
        Some(position.clone())
    }

    /// The venue refused the close; the position goes back to Open.
    pub fn abort_close(&mut self, symbol: &str) {
        if let Some(position) = self.open.get_mut(symbol) {
            position.status = PositionStatus::Open;
            position.close_attempts += 1;
            debug!(symbol, attempts = position.close_attempts, "Close aborted");
        }
    }

    /// Put every position left in Closing back to Open. Used when the task
    /// that owned the close was cancelled, so no attempt is counted.
    pub fn reset_closing(&mut self) -> usize {
        let mut reset = 0;
        for (symbol, position) in self.open.iter_mut() {
            if position.status == PositionStatus::Closing {
                position.status = PositionStatus::Open;
                reset += 1;
                debug!(symbol = %symbol, "Interrupted close reset");
            }
        }
        reset
    }

    /// Book a partial exit. Returns the P&L realized by this slice.
    pub fn apply_partial(&mut self, symbol: &str, levels: &[usize], fill: &Fill) -> Option<f64> {
        let position = self.open.get_mut(symbol)?;
        let size = fill.size.min(position.size);
        let pnl = position.pnl_at(fill.price, size) - fill.fees;

        for &i in levels {
            if let Some(tp) = position.take_profits.get_mut(i) {
                tp.filled = true;
            }
        }
        position.size -= size;
        position.realized_pnl += pnl;
        let mark = position.current_price;
        position.mark(mark);

        info!(
            symbol,
            size = format!("{:.6}", size),
            price = format!("{:.4}", fill.price),
            pnl = format!("${:.2}", pnl),
            remaining = format!("{:.6}", position.size),
            "Partial exit"
        );
        self.persist();
        Some(pnl)
    }

    /// Close the rest of a position. Idempotent: `None` when there is
    /// nothing open for `symbol`, so P&L is never booked twice.
    pub fn close(&mut self, symbol: &str, exit_price: f64, fees: f64, reason: CloseReason) -> Option<ClosedTrade> {
        let position = self.open.remove(symbol)?;
        let pnl = position.realized_pnl + position.pnl_at(exit_price, position.size) - fees;
        let entry_notional = position.entry_price * position.initial_size;
        let pnl_percent = if entry_notional > 0.0 {
            pnl / entry_notional * 100.0
        } else {
            0.0
        };

        let trade = ClosedTrade {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.initial_size,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            pnl_percent,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
            reason,
        };
        info!(
            symbol,
            side = %trade.side,
            exit = format!("{:.4}", exit_price),
            pnl = format!("${:.2}", pnl),
            pnl_percent = format!("{:+.2}%", pnl_percent),
            reason = %trade.reason,
            "Position closed"
        );

        self.closed.push(trade.clone());
        if self.closed.len() > MAX_HISTORY {
            let excess = self.closed.len() - MAX_HISTORY;
            self.closed.drain(..excess);
        }
        self.persist();
        Some(trade)
    }

    /// Write the snapshot now. Failures are logged only.
    pub fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        if let Err(e) = storage::save_positions(&self.get_active_positions(), Some(path)) {
            warn!(path = %path, error = %e, "Failed to persist positions");
        }
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, TakeProfit};

    fn intent(symbol: &str, side: Side) -> OrderIntent {
        let (stop, tps) = match side {
            Side::Long => (
                98.0,
                vec![
                    TakeProfit::new(103.0, 0.25),
                    TakeProfit::new(106.0, 0.35),
                    TakeProfit::new(110.0, 0.25),
                ],
            ),
            Side::Short => (102.0, vec![TakeProfit::new(97.0, 0.25)]),
        };
        OrderIntent {
            symbol: symbol.into(),
            side,
            size: 4.0,
            entry_price: 100.0,
            stop_loss: stop,
            take_profits: tps,
            strategy_id: "mcrm".into(),
            entry_reason: String::new(),
            sentiment_coefficient: 1.0,
            technical_score: 85.0,
        }
    }

    fn fill(symbol: &str, side: Side, size: f64, price: f64) -> Fill {
        Fill {
            order_id: format!("f-{}", uuid::Uuid::new_v4()),
            symbol: symbol.into(),
            side,
            size,
            price,
            fees: 0.0,
            timestamp: Utc::now(),
        }
    }

    fn manager_with(symbol: &str, side: Side) -> PositionManager {
        let mut pm = PositionManager::new();
        pm.open(&intent(symbol, side), &fill(symbol, side, 4.0, 100.0)).unwrap();
        pm
    }

    fn mark(pm: &mut PositionManager, symbol: &str, price: f64) {
        pm.update_positions(&[(symbol.to_string(), price)].into_iter().collect());
    }

    #[test]
    fn test_one_position_per_symbol() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        let err = pm.open(&intent("SOLUSDT", Side::Long), &fill("SOLUSDT", Side::Long, 1.0, 100.0));
        assert!(err.is_err());
        assert_eq!(pm.active_count(), 1);
    }

    #[test]
    fn test_update_and_total_pnl() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        mark(&mut pm, "SOLUSDT", 101.0);
        assert!((pm.unrealized_pnl() - 4.0).abs() < 1e-9);
        assert!((pm.get_total_pnl() - 4.0).abs() < 1e-9);
        assert!((pm.exposure().gross() - 404.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_hit_closes() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        mark(&mut pm, "SOLUSDT", 97.5);
        let p = pm.get("SOLUSDT").unwrap().clone();
        assert_eq!(pm.evaluate_exit(&p), ExitDecision::Close(CloseReason::StopLoss));
    }

    #[test]
    fn test_first_take_profit_is_partial() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        mark(&mut pm, "SOLUSDT", 103.5);
        let p = pm.get("SOLUSDT").unwrap().clone();
        assert_eq!(
            pm.evaluate_exit(&p),
            ExitDecision::Partial {
                levels: vec![0],
                size: 1.0
            }
        );
    }

    #[test]
    fn test_gap_through_two_levels() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        mark(&mut pm, "SOLUSDT", 107.0);
        let p = pm.get("SOLUSDT").unwrap().clone();
        match pm.evaluate_exit(&p) {
            ExitDecision::Partial { levels, size } => {
                assert_eq!(levels, vec![0, 1]);
                assert!((size - 2.4).abs() < 1e-9);
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn test_apply_partial_books_pnl_and_marks_levels() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        mark(&mut pm, "SOLUSDT", 103.0);
        let pnl = pm
            .apply_partial("SOLUSDT", &[0], &fill("SOLUSDT", Side::Short, 1.0, 103.0))
            .unwrap();
        assert!((pnl - 3.0).abs() < 1e-9);

        let p = pm.get("SOLUSDT").unwrap().clone();
        assert!((p.size - 3.0).abs() < 1e-9);
        assert!(p.take_profits[0].filled);
        // Already-filled rung is not triggered again.
        assert_eq!(pm.evaluate_exit(&p), ExitDecision::Hold);
        assert!((pm.realized_pnl() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_last_rung_closes_remaining() {
        let mut pm = manager_with("SOLUSDT", Side::Short);
        mark(&mut pm, "SOLUSDT", 96.0);
        let p = pm.get("SOLUSDT").unwrap().clone();
        assert_eq!(
            pm.evaluate_exit(&p),
            ExitDecision::Partial {
                levels: vec![0],
                size: 1.0
            }
        );
        pm.apply_partial("SOLUSDT", &[0], &fill("SOLUSDT", Side::Long, 1.0, 96.0));
        let p = pm.get("SOLUSDT").unwrap().clone();
        assert_eq!(pm.evaluate_exit(&p), ExitDecision::Hold);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        mark(&mut pm, "SOLUSDT", 103.0);
        pm.apply_partial("SOLUSDT", &[0], &fill("SOLUSDT", Side::Short, 1.0, 103.0));

        let trade = pm.close("SOLUSDT", 105.0, 0.0, CloseReason::Manual).unwrap();
        // 3 from the partial + 3 units × 5
        assert!((trade.pnl - 18.0).abs() < 1e-9);
        assert!((trade.pnl_percent - 4.5).abs() < 1e-9);
        assert!(pm.close("SOLUSDT", 105.0, 0.0, CloseReason::Manual).is_none());
        assert_eq!(pm.closed_trades().len(), 1);
        assert!((pm.get_total_pnl() - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_begin_and_abort_close() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        assert!(pm.begin_close("SOLUSDT").is_some());
        assert!(pm.begin_close("SOLUSDT").is_none());
        let p = pm.get("SOLUSDT").unwrap().clone();
        assert_eq!(pm.evaluate_exit(&p), ExitDecision::Hold);

        pm.abort_close("SOLUSDT");
        let p = pm.get("SOLUSDT").unwrap();
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.close_attempts, 1);
        assert!(pm.begin_close("UNKNOWN").is_none());
    }

    #[test]
    fn test_reset_closing_reopens_without_attempt() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        pm.open(&intent("ETHUSDT", Side::Long), &fill("ETHUSDT", Side::Long, 4.0, 100.0))
            .unwrap();
        assert!(pm.begin_close("SOLUSDT").is_some());

        assert_eq!(pm.reset_closing(), 1);
        let p = pm.get("SOLUSDT").unwrap();
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.close_attempts, 0);
        assert!(pm.begin_close("SOLUSDT").is_some());
        assert_eq!(pm.reset_closing(), 1);
        assert_eq!(pm.reset_closing(), 0);
    }

    #[test]
    fn test_restore_skips_duplicates() {
        let mut pm = manager_with("SOLUSDT", Side::Long);
        let other = manager_with("ETHUSDT", Side::Short).get_active_positions();
        let mut dup = pm.get_active_positions();
        dup.extend(other);
        assert_eq!(pm.restore(dup), 1);
        assert_eq!(pm.active_count(), 2);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let path = std::env::temp_dir()
            .join(format!("momentum_pm_{}.json", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string();
        let mut pm = PositionManager::new().with_persistence(&path);
        pm.open(&intent("SOLUSDT", Side::Long), &fill("SOLUSDT", Side::Long, 4.0, 100.0))
            .unwrap();

        let saved = storage::load_positions(Some(&path)).unwrap().unwrap();
        assert_eq!(saved.len(), 1);
        let mut fresh = PositionManager::new();
        assert_eq!(fresh.restore(saved), 1);
        assert!(fresh.has_position("SOLUSDT"));

        pm.close("SOLUSDT", 100.0, 0.0, CloseReason::Manual);
        assert!(storage::load_positions(Some(&path)).unwrap().unwrap().is_empty());
        storage::delete_positions(Some(&path)).unwrap();
    }
}
