//! Risk manager.
//!
//! Holds the circuit breaker latch, daily loss tracking, temporary symbol
//! restrictions, and the exposure snapshot used to veto and size new
//! positions. The breaker only clears on an explicit operator reset; a new
//! trading day resets daily P&L but never the latch.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::types::SentimentSignal;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub initial_equity: f64,
    pub max_positions: usize,
    /// Fraction of equity risked per trade before sentiment scaling.
    pub base_risk_per_trade: f64,
    /// Hard cap on risk per trade as a fraction of equity.
    pub max_risk_per_trade: f64,
    pub max_sector_exposure: f64,
    pub max_portfolio_exposure: f64,
    /// Daily loss (fraction of day-start equity) that trips the breaker.
    pub max_daily_loss: f64,
    pub restriction_minutes: i64,
    /// symbol -> sector. Unmapped symbols are exempt from the sector cap.
    pub sectors: HashMap<String, String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_equity: 10_000.0,
            max_positions: 12,
            base_risk_per_trade: 0.01,   // 1% of equity
            max_risk_per_trade: 0.02,    // never more than 2%
            max_sector_exposure: 0.25,   // 25% of equity per sector
            max_portfolio_exposure: 0.60, // 60% gross notional
            max_daily_loss: 0.05,        // 5% daily loss trips the breaker
            restriction_minutes: 30,
            sectors: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rejections and exposure
// ---------------------------------------------------------------------------

/// Why a new position was vetoed.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    CircuitBreakerActive,
    ExistingPosition,
    Restricted { until: DateTime<Utc> },
    MaxPositions { limit: usize },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::CircuitBreakerActive => write!(f, "circuit breaker active"),
            RejectionReason::ExistingPosition => write!(f, "position already open"),
            RejectionReason::Restricted { until } => {
                write!(f, "symbol restricted until {}", until.format("%H:%M:%S UTC"))
            }
            RejectionReason::MaxPositions { limit } => write!(f, "max positions ({limit}) reached"),
        }
    }
}

/// Notional exposure of the open book.
#[derive(Debug, Clone, Default)]
pub struct Exposure {
    pub by_symbol: HashMap<String, f64>,
}

impl Exposure {
    pub fn gross(&self) -> f64 {
        self.by_symbol.values().map(|v| v.abs()).sum()
    }

    pub fn symbols(&self) -> HashSet<&str> {
        self.by_symbol.keys().map(String::as_str).collect()
    }

    pub fn count(&self) -> usize {
        self.by_symbol.len()
    }
}

#[derive(Debug, Clone)]
struct BreakerTrip {
    reason: String,
    tripped_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Risk manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    config: RiskConfig,
    equity: f64,
    day: NaiveDate,
    day_start_equity: f64,
    realized_today: f64,
    unrealized: f64,
    breaker: Option<BreakerTrip>,
    restrictions: HashMap<String, DateTime<Utc>>,
    exposure: Exposure,
    bus: Option<EventBus>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        let equity = config.initial_equity;
        Self {
            config,
            equity,
            day: Utc::now().date_naive(),
            day_start_equity: equity,
            realized_today: 0.0,
            unrealized: 0.0,
            breaker: None,
            restrictions: HashMap::new(),
            exposure: Exposure::default(),
            bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Current equity (initial plus all realized P&L).
    pub fn equity(&self) -> f64 {
        self.equity
    }

    /// Realized P&L today plus current unrealized P&L.
    pub fn daily_pnl(&self) -> f64 {
        self.realized_today + self.unrealized
    }

    // -- Circuit breaker --------------------------------------------------

    pub fn is_circuit_breaker_active(&self) -> bool {
        self.breaker.is_some()
    }

    pub fn breaker_reason(&self) -> Option<&str> {
        self.breaker.as_ref().map(|b| b.reason.as_str())
    }

    pub fn breaker_tripped_at(&self) -> Option<DateTime<Utc>> {
        self.breaker.as_ref().map(|b| b.tripped_at)
    }

    /// Latch the breaker. Returns false if it was already active.
    pub fn trip_circuit_breaker(&mut self, reason: &str) -> bool {
        if self.breaker.is_some() {
            return false;
        }
        warn!(reason, daily_pnl = format!("${:.2}", self.daily_pnl()), "Circuit breaker tripped");
        self.breaker = Some(BreakerTrip {
            reason: reason.to_string(),
            tripped_at: Utc::now(),
        });
        self.publish(EngineEvent::CircuitBreakerTripped {
            reason: reason.to_string(),
        });
        true
    }

    /// Clear the breaker. Only an operator action may do this.
    pub fn reset_circuit_breaker(&mut self, operator: &str) {
        match self.breaker.take() {
            Some(trip) => {
                info!(
                    operator,
                    reason = %trip.reason,
                    tripped_at = %trip.tripped_at,
                    "Circuit breaker reset"
                );
                self.publish(EngineEvent::CircuitBreakerReset {
                    operator: operator.to_string(),
                });
            }
            None => debug!(operator, "Circuit breaker reset requested but not active"),
        }
    }

    // -- Daily P&L --------------------------------------------------------

    /// Start a new trading day if `now` falls on a later UTC date.
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= self.day {
            return false;
        }
        info!(
            previous_day = %self.day,
            realized = format!("${:.2}", self.realized_today),
            equity = format!("${:.2}", self.equity),
            breaker_active = self.is_circuit_breaker_active(),
            "New trading day"
        );
        self.day = today;
        self.day_start_equity = self.equity;
        self.realized_today = 0.0;
        true
    }

    /// Book an exit. `unrealized` is the book's open P&L after the exit, so
    /// the closed slice is counted once, as realized.
    pub fn book_exit(&mut self, realized: f64, unrealized: f64) {
        if realized.is_finite() {
            self.equity += realized;
            self.realized_today += realized;
        }
        self.unrealized = if unrealized.is_finite() { unrealized } else { 0.0 };
        self.check_daily_loss();
    }

    pub fn update_unrealized(&mut self, unrealized: f64) {
        self.unrealized = if unrealized.is_finite() { unrealized } else { 0.0 };
        self.check_daily_loss();
    }

    fn check_daily_loss(&mut self) {
        let limit = self.day_start_equity * self.config.max_daily_loss;
        let pnl = self.daily_pnl();
        if pnl <= -limit && !self.is_circuit_breaker_active() {
            let reason = format!(
                "daily loss ${:.2} exceeds limit ${:.2}",
                -pnl, limit
            );
            self.trip_circuit_breaker(&reason);
        }
    }

    // -- Restrictions -----------------------------------------------------

    pub fn add_temporary_restriction(&mut self, symbol: &str, duration: chrono::Duration) {
        let until = Utc::now() + duration;
        info!(symbol, until = %until, "Temporary restriction added");
        self.restrictions
            .entry(symbol.to_string())
            .and_modify(|existing| {
                if until > *existing {
                    *existing = until;
                }
            })
            .or_insert(until);
    }

    /// Restriction of the configured default length.
    pub fn restrict_default(&mut self, symbol: &str) {
        let minutes = self.config.restriction_minutes;
        self.add_temporary_restriction(symbol, chrono::Duration::minutes(minutes));
    }

    pub fn restriction_until(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.restrictions
            .get(symbol)
            .copied()
            .filter(|until| *until > Utc::now())
    }

    pub fn is_restricted(&self, symbol: &str) -> bool {
        self.restriction_until(symbol).is_some()
    }

    /// Drop expired restrictions. Returns how many were removed.
    pub fn prune_restrictions(&mut self) -> usize {
        let now = Utc::now();
        let before = self.restrictions.len();
        self.restrictions.retain(|_, until| *until > now);
        before - self.restrictions.len()
    }

    // -- Exposure ---------------------------------------------------------

    pub fn sync_exposure(&mut self, exposure: Exposure) {
        self.exposure = exposure;
    }

    pub fn exposure(&self) -> &Exposure {
        &self.exposure
    }

    pub fn sector_of(&self, symbol: &str) -> Option<&str> {
        self.config.sectors.get(symbol).map(String::as_str)
    }

    fn sector_notional(&self, sector: &str) -> f64 {
        self.exposure
            .by_symbol
            .iter()
            .filter(|(s, _)| self.sector_of(s) == Some(sector))
            .map(|(_, v)| v.abs())
            .sum()
    }

    // -- Gates ------------------------------------------------------------

    /// Veto check for opening a new position on `symbol`.
    pub fn check_new_position(&self, symbol: &str) -> Result<(), RejectionReason> {
        if self.is_circuit_breaker_active() {
            return Err(RejectionReason::CircuitBreakerActive);
        }
        if self.exposure.by_symbol.contains_key(symbol) {
            return Err(RejectionReason::ExistingPosition);
        }
        if let Some(until) = self.restriction_until(symbol) {
            return Err(RejectionReason::Restricted { until });
        }
        if self.exposure.count() >= self.config.max_positions {
            return Err(RejectionReason::MaxPositions {
                limit: self.config.max_positions,
            });
        }
        Ok(())
    }

    pub fn can_take_new_position(&self, symbol: &str) -> bool {
        self.check_new_position(symbol).is_ok()
    }

    /// Position size in units. Zero means "do not trade".
    ///
    /// risk = min(equity × base × clamp(coefficient, 0.5, 1.5), equity × max)
    ///        × (0.5 + 0.5 × confidence / 100)
    /// size = risk / |entry − stop|
    pub fn calculate_position_size(
        &self,
        symbol: &str,
        entry: f64,
        stop: f64,
        sentiment: &SentimentSignal,
    ) -> f64 {
        let distance = (entry - stop).abs();
        if !entry.is_finite() || entry <= 0.0 || !distance.is_finite() || distance <= 0.0 {
            return 0.0;
        }

        let coefficient = if sentiment.coefficient.is_finite() {
            sentiment.coefficient.clamp(0.5, 1.5)
        } else {
            1.0
        };
        let confidence = if sentiment.confidence.is_finite() {
            sentiment.confidence.clamp(0.0, 100.0)
        } else {
            50.0
        };

        let scaled = (self.equity * self.config.base_risk_per_trade * coefficient)
            .min(self.equity * self.config.max_risk_per_trade);
        let risk_amount = scaled * (0.5 + 0.5 * confidence / 100.0);
        let size = risk_amount / distance;
        if !size.is_finite() || size <= 0.0 {
            return 0.0;
        }

        let notional = size * entry;
        let portfolio_cap = self.equity * self.config.max_portfolio_exposure;
        if self.exposure.gross() + notional > portfolio_cap {
            warn!(
                symbol,
                notional = format!("${:.2}", notional),
                gross = format!("${:.2}", self.exposure.gross()),
                cap = format!("${:.2}", portfolio_cap),
                "Portfolio exposure cap reached"
            );
            return 0.0;
        }

        if let Some(sector) = self.sector_of(symbol) {
            let sector_cap = self.equity * self.config.max_sector_exposure;
            let current = self.sector_notional(sector);
            if current + notional > sector_cap {
                warn!(
                    symbol,
                    sector,
                    notional = format!("${:.2}", notional),
                    sector_exposure = format!("${:.2}", current),
                    cap = format!("${:.2}", sector_cap),
                    "Sector exposure cap reached"
                );
                return 0.0;
            }
        }

        debug!(
            symbol,
            risk = format!("${:.2}", risk_amount),
            size = format!("{:.6}", size),
            notional = format!("${:.2}", notional),
            "Position sized"
        );
        size
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sentiment(coefficient: f64, confidence: f64) -> SentimentSignal {
        SentimentSignal {
            coefficient,
            confidence,
            ..SentimentSignal::neutral("SOLUSDT")
        }
    }

    fn exposure(entries: &[(&str, f64)]) -> Exposure {
        Exposure {
            by_symbol: entries.iter().map(|(s, v)| (s.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_base_sizing() {
        let rm = RiskManager::new(RiskConfig::default());
        // risk = 10_000 × 1% × 1.0 × (0.5 + 0.5) = 100; distance 2 → 50 units
        let size = rm.calculate_position_size("SOLUSDT", 100.0, 98.0, &sentiment(1.0, 100.0));
        assert!((size - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_scales_risk() {
        let rm = RiskManager::new(RiskConfig::default());
        // 100 × 0.75 = 75 risk; distance 2.3 → 32.6087
        let size = rm.calculate_position_size("SOLUSDT", 115.0, 112.7, &sentiment(1.0, 50.0));
        assert!((size - 75.0 / 2.3).abs() < 1e-6);
    }

    #[test]
    fn test_coefficient_clamped_and_capped() {
        let rm = RiskManager::new(RiskConfig::default());
        // 3.0 clamps to 1.5 → 150, under the 200 cap
        let size = rm.calculate_position_size("X", 100.0, 90.0, &sentiment(3.0, 100.0));
        assert!((size - 15.0).abs() < 1e-9);

        let rm = RiskManager::new(RiskConfig {
            base_risk_per_trade: 0.02,
            ..RiskConfig::default()
        });
        // 10_000 × 2% × 1.5 = 300 → capped at 200
        let size = rm.calculate_position_size("X", 100.0, 90.0, &sentiment(1.5, 100.0));
        assert!((size - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_distance_or_bad_input_is_zero() {
        let rm = RiskManager::new(RiskConfig::default());
        let s = sentiment(1.0, 50.0);
        assert_eq!(rm.calculate_position_size("X", 100.0, 100.0, &s), 0.0);
        assert_eq!(rm.calculate_position_size("X", f64::NAN, 98.0, &s), 0.0);
        assert_eq!(rm.calculate_position_size("X", -1.0, 98.0, &s), 0.0);
    }

    #[test]
    fn test_portfolio_cap_blocks() {
        let mut rm = RiskManager::new(RiskConfig::default());
        rm.sync_exposure(exposure(&[("ETHUSDT", 3_000.0)]));
        // 5_000 notional + 3_000 > 6_000 cap
        let size = rm.calculate_position_size("SOLUSDT", 100.0, 98.0, &sentiment(1.0, 100.0));
        assert_eq!(size, 0.0);
    }

    #[test]
    fn test_sector_cap_only_for_mapped_symbols() {
        let mut sectors = HashMap::new();
        sectors.insert("SOLUSDT".to_string(), "l1".to_string());
        sectors.insert("AVAXUSDT".to_string(), "l1".to_string());
        let mut rm = RiskManager::new(RiskConfig {
            sectors,
            ..RiskConfig::default()
        });
        rm.sync_exposure(exposure(&[("AVAXUSDT", 1_000.0)]));

        // 1_000 + 1_000 ≤ 2_500: allowed (risk 25 over distance 2.5)
        let small = rm.calculate_position_size("SOLUSDT", 100.0, 97.5, &sentiment(0.5, 0.0));
        assert!((small - 10.0).abs() < 1e-9);

        // 1_000 + 5_000 > 2_500: blocked
        let big = rm.calculate_position_size("SOLUSDT", 100.0, 98.0, &sentiment(1.0, 100.0));
        assert_eq!(big, 0.0);

        // Unmapped symbol ignores sector caps
        let other = rm.calculate_position_size("DOGEUSDT", 100.0, 97.5, &sentiment(1.0, 100.0));
        assert!((other - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_breaker_vetoes_every_symbol() {
        let mut rm = RiskManager::new(RiskConfig::default());
        assert!(rm.can_take_new_position("SOLUSDT"));
        assert!(rm.trip_circuit_breaker("manual"));
        assert!(!rm.trip_circuit_breaker("again"));
        assert_eq!(
            rm.check_new_position("SOLUSDT"),
            Err(RejectionReason::CircuitBreakerActive)
        );
        assert!(!rm.can_take_new_position("ANYTHING"));
        assert_eq!(rm.breaker_reason(), Some("manual"));
    }

    #[test]
    fn test_daily_loss_trips_breaker() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut rm = RiskManager::new(RiskConfig::default()).with_event_bus(bus);

        rm.book_exit(-300.0, 0.0);
        assert!(!rm.is_circuit_breaker_active());
        rm.update_unrealized(-199.0);
        assert!(!rm.is_circuit_breaker_active());
        rm.update_unrealized(-200.0);
        assert!(rm.is_circuit_breaker_active());
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::CircuitBreakerTripped { .. }
        ));
    }

    #[test]
    fn test_exit_inside_limit_counted_once() {
        let mut rm = RiskManager::new(RiskConfig::default());
        // Marked at -315 before the stop fills at the same price.
        rm.update_unrealized(-315.0);
        rm.book_exit(-315.0, 0.0);
        assert!(!rm.is_circuit_breaker_active());
        assert!((rm.daily_pnl() + 315.0).abs() < 1e-9);
        assert!((rm.equity() - 9_685.0).abs() < 1e-9);

        // Partial: 200 realized, 150 still open on the remainder.
        rm.update_unrealized(350.0);
        rm.book_exit(200.0, 150.0);
        assert!((rm.daily_pnl() - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_day_rollover_keeps_breaker_latched() {
        let mut rm = RiskManager::new(RiskConfig::default());
        rm.book_exit(-600.0, 0.0);
        assert!(rm.is_circuit_breaker_active());

        let tomorrow = Utc::now() + Duration::days(1);
        assert!(rm.roll_day(tomorrow));
        assert_eq!(rm.daily_pnl(), 0.0);
        assert!(rm.is_circuit_breaker_active());
        assert!((rm.equity() - 9_400.0).abs() < 1e-9);

        rm.reset_circuit_breaker("ops@desk");
        assert!(!rm.is_circuit_breaker_active());
    }

    #[test]
    fn test_roll_day_ignores_same_or_past_day() {
        let mut rm = RiskManager::new(RiskConfig::default());
        assert!(!rm.roll_day(Utc::now()));
        let past = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert!(!rm.roll_day(past));
    }

    #[test]
    fn test_existing_position_and_max_positions() {
        let mut rm = RiskManager::new(RiskConfig {
            max_positions: 2,
            ..RiskConfig::default()
        });
        rm.sync_exposure(exposure(&[("A", 10.0)]));
        assert_eq!(rm.check_new_position("A"), Err(RejectionReason::ExistingPosition));
        assert!(rm.can_take_new_position("B"));

        rm.sync_exposure(exposure(&[("A", 10.0), ("B", 10.0)]));
        assert_eq!(
            rm.check_new_position("C"),
            Err(RejectionReason::MaxPositions { limit: 2 })
        );
    }

    #[test]
    fn test_restriction_expires() {
        let mut rm = RiskManager::new(RiskConfig::default());
        rm.restrict_default("ARBUSDT");
        assert!(matches!(
            rm.check_new_position("ARBUSDT"),
            Err(RejectionReason::Restricted { .. })
        ));

        rm.add_temporary_restriction("OPUSDT", Duration::seconds(-1));
        assert!(rm.can_take_new_position("OPUSDT"));
        assert_eq!(rm.prune_restrictions(), 1);
        assert!(rm.is_restricted("ARBUSDT"));
    }
}
