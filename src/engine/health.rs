//! Health monitor.
//!
//! Keeps a ring of recent errors and a consecutive execution-failure streak,
//! and turns dependency probes into a `SystemHealth` snapshot.

use chrono::Utc;
use std::collections::VecDeque;
use std::fmt;

use crate::types::SystemHealth;

/// Recent errors kept for the health snapshot.
const ERROR_RING: usize = 20;

/// Liveness of each external dependency at check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyProbe {
    pub data_source: bool,
    pub execution_venue: bool,
    pub sentiment_source: bool,
}

/// Book state folded into the snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookSnapshot {
    pub open_positions: usize,
    pub daily_pnl: f64,
    pub circuit_breaker_active: bool,
}

pub struct HealthMonitor {
    recent_errors: VecDeque<String>,
    capacity: usize,
    execution_failures: u32,
    last: Option<SystemHealth>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::with_capacity(ERROR_RING)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent_errors: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            execution_failures: 0,
            last: None,
        }
    }

    /// Remember an error as `"[HH:MM:SS] step: cause"`.
    pub fn record_error(&mut self, step: &str, cause: &dyn fmt::Display) {
        if self.recent_errors.len() == self.capacity {
            self.recent_errors.pop_front();
        }
        self.recent_errors
            .push_back(format!("[{}] {step}: {cause}", Utc::now().format("%H:%M:%S")));
    }

    pub fn record_execution_success(&mut self) {
        self.execution_failures = 0;
    }

    pub fn record_execution_failure(&mut self, symbol: &str, cause: &dyn fmt::Display) {
        self.execution_failures += 1;
        self.record_error(&format!("execution {symbol}"), cause);
    }

    pub fn execution_failure_streak(&self) -> u32 {
        self.execution_failures
    }

    /// True once `threshold` orders in a row have failed. 0 never trips.
    pub fn execution_degraded(&self, threshold: u32) -> bool {
        threshold > 0 && self.execution_failures >= threshold
    }

    pub fn clear_execution_streak(&mut self) {
        self.execution_failures = 0;
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.recent_errors.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&SystemHealth> {
        self.last.as_ref()
    }

    /// Build and remember a snapshot.
    pub fn assess(&mut self, probe: DependencyProbe, book: BookSnapshot) -> SystemHealth {
        let health = SystemHealth {
            timestamp: Utc::now(),
            data_source: probe.data_source,
            execution_venue: probe.execution_venue,
            sentiment_source: probe.sentiment_source,
            open_position_count: book.open_positions,
            daily_pnl: book.daily_pnl,
            circuit_breaker_active: book.circuit_breaker_active,
            recent_errors: self.recent_errors(),
        };
        self.last = Some(health.clone());
        health
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
