//! Engine event bus.
//!
//! Components publish `EngineEvent`s to a broadcast channel; alerting,
//! journaling, and tests subscribe without the publishers knowing who
//! listens. Publishing with no subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::engine::control::Phase;
use crate::types::{Conviction, Side};

/// Default channel capacity. Slow subscribers lag and skip, never block.
pub const DEFAULT_CAPACITY: usize = 1024;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SignalGenerated {
        symbol: String,
        side: Side,
        strength: u8,
        conviction: Conviction,
    },
    SignalFiltered {
        symbol: String,
        technical_score: f64,
        sentiment_coefficient: f64,
        final_score: f64,
    },
    PositionOpened {
        symbol: String,
        side: Side,
        size: f64,
        entry_price: f64,
        stop_loss: f64,
    },
    PartialExit {
        symbol: String,
        size: f64,
        price: f64,
        pnl: f64,
    },
    PositionClosed {
        symbol: String,
        side: Side,
        exit_price: f64,
        pnl: f64,
        pnl_percent: f64,
        reason: String,
    },
    ExecutionFailed {
        symbol: String,
        message: String,
    },
    CircuitBreakerTripped {
        reason: String,
    },
    CircuitBreakerReset {
        operator: String,
    },
    ConnectionLost {
        component: String,
    },
    ConnectionRestored {
        component: String,
    },
    TradingPaused {
        reason: String,
    },
    TradingResumed,
    HealthDegraded {
        components: Vec<String>,
    },
    HighImpactNews {
        symbol: String,
        reading: f64,
    },
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    CycleCompleted {
        cycle: u64,
        duration_ms: u64,
        symbol_errors: usize,
    },
    EmergencyStop {
        closed: usize,
        failed: usize,
    },
}

impl EngineEvent {
    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::SignalGenerated { .. } => "signal_generated",
            EngineEvent::SignalFiltered { .. } => "signal_filtered",
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::PartialExit { .. } => "partial_exit",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::ExecutionFailed { .. } => "execution_failed",
            EngineEvent::CircuitBreakerTripped { .. } => "circuit_breaker_tripped",
            EngineEvent::CircuitBreakerReset { .. } => "circuit_breaker_reset",
            EngineEvent::ConnectionLost { .. } => "connection_lost",
            EngineEvent::ConnectionRestored { .. } => "connection_restored",
            EngineEvent::TradingPaused { .. } => "trading_paused",
            EngineEvent::TradingResumed => "trading_resumed",
            EngineEvent::HealthDegraded { .. } => "health_degraded",
            EngineEvent::HighImpactNews { .. } => "high_impact_news",
            EngineEvent::PhaseChanged { .. } => "phase_changed",
            EngineEvent::CycleCompleted { .. } => "cycle_completed",
            EngineEvent::EmergencyStop { .. } => "emergency_stop",
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Cloneable handle to the shared broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: EngineEvent) -> usize {
        let name = event.name();
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                trace!(event = name, "No subscribers for event");
                0
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
