//! Order executor.
//!
//! Wraps an `ExecutionVenue` with a per-call timeout and a dry-run mode.
//! Venue failures come back as `EngineError::Execution`; nothing here panics
//! or retries. Retrying is the orchestrator's call.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::{ClosedTrade, CloseReason, EngineError, Fill, OrderIntent, Position, Side};
use crate::venue::ExecutionVenue;

// ---------------------------------------------------------------------------
// Execution report
// ---------------------------------------------------------------------------

/// Outcome of a batch of closes (emergency flattening).
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub executed: Vec<ClosedTrade>,
    pub failed: Vec<FailedOrder>,
}

#[derive(Debug, Clone)]
pub struct FailedOrder {
    pub symbol: String,
    pub reason: String,
}

impl ExecutionReport {
    pub fn failed_symbols(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.symbol.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct OrderExecutor {
    venue: Arc<dyn ExecutionVenue>,
    dry_run: bool,
    timeout: Duration,
}

impl OrderExecutor {
    pub fn new(venue: Arc<dyn ExecutionVenue>, dry_run: bool, timeout: Duration) -> Self {
        Self {
            venue,
            dry_run,
            timeout,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn connect(&self) -> anyhow::Result<()> {
        self.venue.connect().await
    }

    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.venue.disconnect().await
    }

    pub async fn is_healthy(&self) -> bool {
        self.dry_run || self.venue.is_healthy().await
    }

    pub async fn open(&self, intent: &OrderIntent) -> Result<Fill, EngineError> {
        if self.dry_run {
            info!(
                symbol = %intent.symbol,
                side = %intent.side,
                size = format!("{:.6}", intent.size),
                notional = format!("${:.2}", intent.notional()),
                "[DRY RUN] Would open position"
            );
            return Ok(simulated_fill(&intent.symbol, intent.side, intent.size, intent.entry_price));
        }
        self.guarded(&intent.symbol, self.venue.open_position(intent)).await
    }

    pub async fn close(&self, position: &Position, reason: &CloseReason) -> Result<Fill, EngineError> {
        if self.dry_run {
            info!(
                symbol = %position.symbol,
                size = format!("{:.6}", position.size),
                reason = %reason,
                "[DRY RUN] Would close position"
            );
            return Ok(simulated_fill(
                &position.symbol,
                position.side.opposite(),
                position.size,
                position.current_price,
            ));
        }
        self.guarded(&position.symbol, self.venue.close_position(position, reason))
            .await
    }

    pub async fn reduce(&self, position: &Position, size: f64, reason: &CloseReason) -> Result<Fill, EngineError> {
        let size = size.min(position.size);
        if self.dry_run {
            info!(
                symbol = %position.symbol,
                size = format!("{:.6}", size),
                reason = %reason,
                "[DRY RUN] Would reduce position"
            );
            return Ok(simulated_fill(
                &position.symbol,
                position.side.opposite(),
                size,
                position.current_price,
            ));
        }
        self.guarded(&position.symbol, self.venue.reduce_position(position, size, reason))
            .await
    }

    async fn guarded<F>(&self, symbol: &str, call: F) -> Result<Fill, EngineError>
    where
        F: std::future::Future<Output = anyhow::Result<Fill>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(fill)) => Ok(fill),
            Ok(Err(e)) => {
                warn!(symbol, error = %e, "Venue rejected order");
                Err(EngineError::Execution {
                    symbol: symbol.to_string(),
                    message: format!("{e:#}"),
                })
            }
            Err(_) => {
                warn!(symbol, timeout_secs = self.timeout.as_secs_f64(), "Venue call timed out");
                Err(EngineError::Execution {
                    symbol: symbol.to_string(),
                    message: format!("timed out after {:.1}s", self.timeout.as_secs_f64()),
                })
            }
        }
    }
}

fn simulated_fill(symbol: &str, side: Side, size: f64, price: f64) -> Fill {
    Fill {
        order_id: format!("dry-run-{}", uuid::Uuid::new_v4()),
        symbol: symbol.to_string(),
        side,
        size,
        price,
        fees: 0.0,
        timestamp: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
