//! Paper execution venue.
//!
//! Fills every order immediately at the reference price moved against the
//! trader by `slippage_bps`, and charges a flat fee rate on notional.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use super::ExecutionVenue;
use crate::types::{CloseReason, Fill, OrderIntent, Position, Side};

pub struct PaperVenue {
    slippage_bps: f64,
    fee_rate: f64,
    connected: AtomicBool,
    fills: Mutex<Vec<Fill>>,
}

impl PaperVenue {
    pub fn new(slippage_bps: f64, fee_rate: f64) -> Self {
        Self {
            slippage_bps,
            fee_rate,
            connected: AtomicBool::new(false),
            fills: Mutex::new(Vec::new()),
        }
    }

    /// All fills so far, oldest first.
    pub fn fills(&self) -> Vec<Fill> {
        self.fills.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Price after adverse slippage for an order on `side`.
    fn slipped(&self, side: Side, price: f64) -> f64 {
        price * (1.0 + side.direction() * self.slippage_bps / 10_000.0)
    }

    fn record(&self, symbol: &str, side: Side, size: f64, reference: f64) -> Result<Fill> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("Paper venue not connected");
        }
        if !(size > 0.0) || !(reference > 0.0) {
            bail!("Invalid paper order for {symbol}: size {size}, price {reference}");
        }
        let price = self.slipped(side, reference);
        let fill = Fill {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            symbol: symbol.to_string(),
            side,
            size,
            price,
            fees: size * price * self.fee_rate,
            timestamp: Utc::now(),
        };
        debug!(
            symbol,
            side = %side,
            size = format!("{:.6}", size),
            price = format!("{:.4}", price),
            "[PAPER] Filled"
        );
        self.fills
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fill.clone());
        Ok(fill)
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new(5.0, 0.001)
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!(slippage_bps = self.slippage_bps, "Paper venue connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn open_position(&self, intent: &OrderIntent) -> Result<Fill> {
        self.record(&intent.symbol, intent.side, intent.size, intent.entry_price)
    }

    async fn close_position(&self, position: &Position, _reason: &CloseReason) -> Result<Fill> {
        self.record(
            &position.symbol,
            position.side.opposite(),
            position.size,
            position.current_price,
        )
    }

    async fn reduce_position(&self, position: &Position, size: f64, _reason: &CloseReason) -> Result<Fill> {
        self.record(
            &position.symbol,
            position.side.opposite(),
            size.min(position.size),
            position.current_price,
        )
    }

    async fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
