//! Lifecycle control for the orchestrator.
//!
//! `transition` is a pure function over `(Phase, Trigger)`; everything else
//! the orchestrator needs to remember between cycles lives in one owned
//! `ControlState`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

use crate::engine::performance::PerformanceSummary;
use crate::types::{EngineError, Position, SystemHealth};

// ---------------------------------------------------------------------------
// Phase machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Initializing,
    Running,
    Paused,
    /// Transient: positions are being flattened.
    EmergencyStopping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Stopped => "stopped",
            Phase::Initializing => "initializing",
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::EmergencyStopping => "emergency_stopping",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    InitSucceeded,
    InitFailed,
    Pause,
    Resume,
    Stop,
    ErrorBudgetExhausted,
    EmergencyStop,
    EmergencyComplete,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Next phase for `trigger`, or `InvalidTransition`.
pub fn transition(from: Phase, trigger: Trigger) -> Result<Phase, EngineError> {
    use Phase::*;
    use Trigger::*;

    let next = match (from, trigger) {
        (Stopped, Start) => Initializing,
        (Initializing, InitSucceeded) => Running,
        (Initializing, InitFailed) => Stopped,
        (Running, Pause) | (Paused, Pause) => Paused,
        (Paused, Resume) => Running,
        (Stopped, Stop) | (Initializing, Stop) | (Running, Stop) | (Paused, Stop) => Stopped,
        (Running, ErrorBudgetExhausted) | (Paused, ErrorBudgetExhausted) => Stopped,
        (EmergencyStopping, EmergencyStop) => {
            return Err(EngineError::InvalidTransition {
                from: from.to_string(),
                trigger: trigger.to_string(),
            })
        }
        (_, EmergencyStop) => EmergencyStopping,
        (EmergencyStopping, EmergencyComplete) => Stopped,
        _ => {
            return Err(EngineError::InvalidTransition {
                from: from.to_string(),
                trigger: trigger.to_string(),
            })
        }
    };
    Ok(next)
}

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

/// Why trading is paused. Only non-manual pauses auto-resume.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseReason {
    Manual,
    Connectivity(String),
    Degraded(Vec<String>),
}

impl PauseReason {
    pub fn is_manual(&self) -> bool {
        matches!(self, PauseReason::Manual)
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Manual => write!(f, "manual"),
            PauseReason::Connectivity(c) => write!(f, "connection lost: {c}"),
            PauseReason::Degraded(parts) => write!(f, "degraded: {}", parts.join(", ")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlState {
    pub phase: Phase,
    pub consecutive_errors: u32,
    pub max_consecutive_errors: u32,
    pub cycle_count: u64,
    pub last_health_check: Option<Instant>,
    pub pause_reason: Option<PauseReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl ControlState {
    pub fn new(max_consecutive_errors: u32) -> Self {
        Self {
            phase: Phase::Stopped,
            consecutive_errors: 0,
            max_consecutive_errors: max_consecutive_errors.max(1),
            cycle_count: 0,
            last_health_check: None,
            pause_reason: None,
            started_at: None,
            last_cycle_at: None,
        }
    }

    /// Apply `trigger`, returning `(from, to)`. State is untouched on error.
    pub fn apply(&mut self, trigger: Trigger) -> Result<(Phase, Phase), EngineError> {
        let from = self.phase;
        let to = transition(from, trigger)?;
        self.phase = to;
        if to != Phase::Paused {
            self.pause_reason = None;
        }
        Ok((from, to))
    }

    /// A clean cycle resets the error budget.
    pub fn record_success(&mut self) {
        self.cycle_count += 1;
        self.consecutive_errors = 0;
        self.last_cycle_at = Some(Utc::now());
    }

    /// Count a failed cycle. Returns true when the budget is now exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.cycle_count += 1;
        self.consecutive_errors += 1;
        self.last_cycle_at = Some(Utc::now());
        self.consecutive_errors >= self.max_consecutive_errors
    }

    pub fn health_check_due(&self, every: Duration) -> bool {
        match self.last_health_check {
            None => true,
            Some(at) => at.elapsed() >= every,
        }
    }

    pub fn mark_health_checked(&mut self) {
        self.last_health_check = Some(Instant::now());
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Running | Phase::Paused)
    }
}

// ---------------------------------------------------------------------------
// Published status
// ---------------------------------------------------------------------------

/// Snapshot published after every cycle and every phase change.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub phase: Phase,
    pub pause_reason: Option<String>,
    pub cycle_count: u64,
    pub consecutive_errors: u32,
    pub open_positions: usize,
    pub positions: Vec<Position>,
    pub equity: f64,
    pub daily_pnl: f64,
    pub total_pnl: f64,
    pub circuit_breaker_active: bool,
    pub circuit_breaker_reason: Option<String>,
    pub health: Option<SystemHealth>,
    pub performance: PerformanceSummary,
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EngineStatus {
    pub fn initial(equity: f64) -> Self {
        Self {
            phase: Phase::Stopped,
            pause_reason: None,
            cycle_count: 0,
            consecutive_errors: 0,
            open_positions: 0,
            positions: Vec::new(),
            equity,
            daily_pnl: 0.0,
            total_pnl: 0.0,
            circuit_breaker_active: false,
            circuit_breaker_reason: None,
            health: None,
            performance: PerformanceSummary::default(),
            started_at: None,
            last_cycle_at: None,
            updated_at: Utc::now(),
        }
    }
}
