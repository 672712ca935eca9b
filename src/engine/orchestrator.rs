//! Trading orchestrator.
//!
//! One task owns the orchestrator and drives it from a tokio interval, so
//! cycles never overlap. Everything else talks to it through an
//! `OrchestratorHandle`: commands over mpsc, status over watch, and an
//! emergency `Notify` that can pre-empt a running cycle.
//!
//! Cycle order:
//! 1. Health check when due (may pause trading)
//! 2. High-impact news restrictions, day roll, market data refresh
//! 3. Mark positions and execute exits
//! 4. Entries, unless the circuit breaker is active
//! 5. Performance and status

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::control::{ControlState, EngineStatus, PauseReason, Phase, Trigger};
use crate::engine::executor::{ExecutionReport, FailedOrder, OrderExecutor};
use crate::engine::health::{BookSnapshot, DependencyProbe, HealthMonitor};
use crate::engine::performance::PerformanceTracker;
use crate::engine::positions::{ExitDecision, PositionManager};
use crate::events::{EngineEvent, EventBus};
use crate::sentiment::SentimentAggregator;
use crate::storage::{self, Journal, JournalEntry};
use crate::strategy::{DecisionRecord, StrategyPipeline};
use crate::types::{CandleSet, CloseReason, ClosedTrade, EngineError, OrderIntent, Position, SystemHealth};
use crate::venue::{ConnectivityEvent, MarketDataProvider};

const COMMAND_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cycle_interval_secs: u64,
    pub health_check_interval_secs: u64,
    /// Consecutive failed cycles before the engine stops itself.
    pub max_consecutive_errors: u32,
    /// Candles requested per timeframe.
    pub candle_limit: usize,
    /// Fixed universe. Empty means "ask the market data provider".
    pub symbols: Vec<String>,
    /// Extra passes over positions that failed to close on emergency stop.
    pub emergency_retry_rounds: u32,
    pub emergency_retry_delay_ms: u64,
    /// Consecutive failed orders that mark the venue degraded. 0 disables.
    pub execution_failure_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            health_check_interval_secs: 300, // 5 minutes
            max_consecutive_errors: 10,
            candle_limit: 200,
            symbols: Vec::new(),
            emergency_retry_rounds: 3,
            emergency_retry_delay_ms: 500,
            execution_failure_threshold: 5,
        }
    }
}

impl EngineConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Commands and handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pause,
    Resume,
    Stop,
    TripCircuitBreaker(String),
    ResetCircuitBreaker(String),
    Connectivity(ConnectivityEvent),
}

/// Cloneable control surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<EngineStatus>,
    emergency: Arc<Notify>,
}

impl OrchestratorHandle {
    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Config("orchestrator is no longer running".to_string()))
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.send(Command::Resume).await
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.send(Command::Stop).await
    }

    pub async fn trip_circuit_breaker(&self, reason: &str) -> Result<(), EngineError> {
        self.send(Command::TripCircuitBreaker(reason.to_string())).await
    }

    pub async fn reset_circuit_breaker(&self, operator: &str) -> Result<(), EngineError> {
        self.send(Command::ResetCircuitBreaker(operator.to_string())).await
    }

    pub async fn report_connectivity(&self, event: ConnectivityEvent) -> Result<(), EngineError> {
        self.send(Command::Connectivity(event)).await
    }

    /// Pre-empts a cycle in flight. Never blocks.
    pub fn emergency_stop(&self) {
        self.emergency.notify_one();
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }
}

// ---------------------------------------------------------------------------
// Cycle summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub symbols: usize,
    pub symbol_errors: usize,
    pub opened: usize,
    pub closed: usize,
    /// Set when a health check paused trading mid-cycle.
    pub skipped: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct TradingOrchestrator {
    config: EngineConfig,
    market: Arc<dyn MarketDataProvider>,
    executor: OrderExecutor,
    sentiment: Arc<SentimentAggregator>,
    pipeline: StrategyPipeline,
    positions: PositionManager,
    performance: PerformanceTracker,
    health: HealthMonitor,
    control: ControlState,
    bus: EventBus,
    journal: Option<Journal>,
    candles: HashMap<String, CandleSet>,
    symbols: Vec<String>,
    status_tx: watch::Sender<EngineStatus>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    emergency: Arc<Notify>,
}

impl TradingOrchestrator {
    pub fn new(
        config: EngineConfig,
        market: Arc<dyn MarketDataProvider>,
        executor: OrderExecutor,
        sentiment: Arc<SentimentAggregator>,
        pipeline: StrategyPipeline,
        bus: EventBus,
    ) -> Self {
        let equity = pipeline.risk().equity();
        let (status_tx, _) = watch::channel(EngineStatus::initial(equity));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        Self {
            control: ControlState::new(config.max_consecutive_errors),
            config,
            market,
            executor,
            sentiment,
            pipeline,
            positions: PositionManager::new(),
            performance: PerformanceTracker::new(equity),
            health: HealthMonitor::new(),
            bus,
            journal: None,
            candles: HashMap::new(),
            symbols: Vec::new(),
            status_tx,
            commands_tx,
            commands_rx,
            emergency: Arc::new(Notify::new()),
        }
    }

    /// Use `positions` (and its persistence path) instead of an empty book.
    pub fn with_positions(mut self, positions: PositionManager) -> Self {
        self.positions = positions;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            commands: self.commands_tx.clone(),
            status: self.status_tx.subscribe(),
            emergency: Arc::clone(&self.emergency),
        }
    }

    // -- Accessors -----------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.control.phase
    }

    pub fn control(&self) -> &ControlState {
        &self.control
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn pipeline(&self) -> &StrategyPipeline {
        &self.pipeline
    }

    pub fn last_health(&self) -> Option<&SystemHealth> {
        self.health.last()
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.health.recent_errors()
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Connect collaborators in order and restore saved positions.
    /// Any failure leaves the engine Stopped.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.transition(Trigger::Start)?;
        info!("Starting trading orchestrator");

        if let Err(e) = self.initialize().await {
            error!(error = %e, "Initialization failed");
            self.health.record_error("startup", &e);
            self.transition(Trigger::InitFailed)?;
            return Err(e);
        }

        self.control.started_at = Some(Utc::now());
        self.transition(Trigger::InitSucceeded)?;
        info!(
            symbols = self.symbols.len(),
            open_positions = self.positions.active_count(),
            dry_run = self.executor.is_dry_run(),
            "Trading orchestrator running"
        );
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        self.market.connect().await.map_err(|e| startup("market_data", e))?;
        self.executor
            .connect()
            .await
            .map_err(|e| startup("execution_venue", e))?;
        self.sentiment.connect().await.map_err(|e| startup("sentiment", e))?;

        if let Some(path) = self.positions.persist_path().map(str::to_string) {
            match storage::load_positions(Some(&path)) {
                Ok(Some(saved)) => {
                    self.positions.restore(saved);
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path, error = %e, "Could not restore positions"),
            }
        }
        self.sync_risk();

        match self.refresh_symbols().await {
            Ok(symbols) => debug!(count = symbols.len(), "Symbol universe loaded"),
            Err(e) => warn!(error = %e, "Symbol universe unavailable at startup"),
        }
        Ok(())
    }

    /// Stop scheduling, persist, disconnect. Positions stay open.
    pub async fn stop(&mut self) {
        self.shutdown(Trigger::Stop).await;
    }

    async fn shutdown(&mut self, trigger: Trigger) {
        if let Err(e) = self.transition(trigger) {
            debug!(error = %e, "Shutdown transition skipped");
        }
        self.positions.persist();
        if let Err(e) = self.market.disconnect().await {
            warn!(error = %e, "Market data disconnect failed");
        }
        if let Err(e) = self.executor.disconnect().await {
            warn!(error = %e, "Execution venue disconnect failed");
        }
        info!(
            open_positions = self.positions.active_count(),
            cycles = self.control.cycle_count,
            "Trading orchestrator stopped"
        );
        self.publish_status();
    }

    /// Flatten every position, retrying failures, then stop.
    pub async fn emergency_stop(&mut self) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        if let Err(e) = self.transition(Trigger::EmergencyStop) {
            warn!(error = %e, "Emergency stop already in progress");
            return report;
        }
        warn!(open_positions = self.positions.active_count(), "EMERGENCY STOP");

        // A pre-empted cycle can leave a close in flight.
        let interrupted = self.positions.reset_closing();
        if interrupted > 0 {
            warn!(count = interrupted, "Interrupted closes reopened for emergency close");
        }

        let mut pending = self.positions.symbols();
        for round in 0..=self.config.emergency_retry_rounds {
            if pending.is_empty() {
                break;
            }
            if round > 0 {
                warn!(round, remaining = pending.len(), "Retrying emergency closes");
                tokio::time::sleep(Duration::from_millis(self.config.emergency_retry_delay_ms)).await;
            }
            let mut failed = Vec::new();
            for symbol in pending {
                match self.close_position(&symbol, CloseReason::EmergencyStop).await {
                    Ok(Some(trade)) => report.executed.push(trade),
                    Ok(None) if self.positions.has_position(&symbol) => {
                        error!(symbol = %symbol, round, "Emergency close did not complete");
                        failed.push((symbol, "close did not complete".to_string()));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(symbol = %symbol, round, error = %e, "Emergency close failed");
                        failed.push((symbol, e.to_string()));
                    }
                }
            }
            pending = failed.iter().map(|(s, _)| s.clone()).collect();
            report.failed = failed
                .into_iter()
                .map(|(symbol, reason)| FailedOrder { symbol, reason })
                .collect();
        }
        self.sync_risk();

        let failed_symbols = report.failed_symbols();
        if !failed_symbols.is_empty() {
            error!(symbols = ?failed_symbols, "Positions left open after emergency stop");
        }
        self.bus.publish(EngineEvent::EmergencyStop {
            closed: report.executed.len(),
            failed: report.failed.len(),
        });
        self.journal(JournalEntry::EmergencyStop {
            closed: report.executed.len(),
            failed: failed_symbols,
        });

        if let Err(e) = self.transition(Trigger::EmergencyComplete) {
            error!(error = %e, "Emergency stop could not complete");
        }
        self.positions.persist();
        if let Err(e) = self.market.disconnect().await {
            warn!(error = %e, "Market data disconnect failed");
        }
        if let Err(e) = self.executor.disconnect().await {
            warn!(error = %e, "Execution venue disconnect failed");
        }
        self.publish_status();
        report
    }

    // -- Run loop ------------------------------------------------------------

    /// Drive the engine until it stops. Ticks that fire while a cycle is
    /// still running are skipped.
    pub async fn run(&mut self) {
        let emergency = Arc::clone(&self.emergency);
        let mut interval = tokio::time::interval(self.config.cycle_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.cycle_interval().as_secs(),
            "Entering trading loop"
        );

        loop {
            if !self.control.is_active() {
                break;
            }
            tokio::select! {
                biased;
                _ = emergency.notified() => {
                    self.emergency_stop().await;
                    break;
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = interval.tick() => {
                    let outcome = tokio::select! {
                        biased;
                        _ = emergency.notified() => None,
                        result = self.tick() => Some(result),
                    };
                    match outcome {
                        None => {
                            warn!("Cycle pre-empted by emergency stop");
                            self.emergency_stop().await;
                            break;
                        }
                        Some(Err(e)) => error!(error = %e, "Trading loop ending"),
                        Some(Ok(())) => {}
                    }
                }
            }
        }
        info!(phase = %self.control.phase, "Trading loop exited");
    }

    pub async fn handle_command(&mut self, command: Command) {
        debug!(command = ?command, "Command received");
        match command {
            Command::Pause => self.pause(PauseReason::Manual),
            Command::Resume => {
                self.resume(true);
            }
            Command::Stop => self.stop().await,
            Command::TripCircuitBreaker(reason) => {
                self.pipeline.risk_mut().trip_circuit_breaker(&reason);
            }
            Command::ResetCircuitBreaker(operator) => {
                self.pipeline.risk_mut().reset_circuit_breaker(&operator);
            }
            Command::Connectivity(event) => self.on_connectivity(event).await,
        }
        self.publish_status();
    }

    /// One scheduler tick. Runs a cycle when Running; when Paused only the
    /// due health check runs. Returns `ErrorBudgetExhausted` when this
    /// failure stopped the engine.
    pub async fn tick(&mut self) -> Result<(), EngineError> {
        match self.control.phase {
            Phase::Running => {}
            Phase::Paused => {
                if self.control.health_check_due(self.config.health_check_interval()) {
                    self.health_check().await;
                }
                self.publish_status();
                return Ok(());
            }
            _ => return Ok(()),
        }

        let started = Instant::now();
        let cycle = self.control.cycle_count + 1;
        match self.run_cycle().await {
            Ok(summary) => {
                self.control.record_success();
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    cycle,
                    symbols = summary.symbols,
                    symbol_errors = summary.symbol_errors,
                    opened = summary.opened,
                    closed = summary.closed,
                    open_positions = self.positions.active_count(),
                    daily_pnl = format!("${:.2}", self.pipeline.risk().daily_pnl()),
                    duration_ms,
                    "Cycle complete"
                );
                self.bus.publish(EngineEvent::CycleCompleted {
                    cycle,
                    duration_ms,
                    symbol_errors: summary.symbol_errors,
                });
                self.performance.log_summary(Utc::now());
            }
            Err(e) => {
                self.health.record_error("cycle", &e);
                let exhausted = self.control.record_failure();
                error!(
                    cycle,
                    consecutive_errors = self.control.consecutive_errors,
                    max = self.control.max_consecutive_errors,
                    error = %e,
                    "Cycle failed"
                );
                if exhausted {
                    let n = self.control.consecutive_errors;
                    error!(consecutive_errors = n, "Error budget exhausted, stopping");
                    self.shutdown(Trigger::ErrorBudgetExhausted).await;
                    return Err(EngineError::ErrorBudgetExhausted(n));
                }
            }
        }
        self.publish_status();
        Ok(())
    }

    /// One full trading cycle. Per-symbol and per-position failures are
    /// isolated; the cycle itself fails only when no market data at all
    /// could be obtained.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, EngineError> {
        let mut summary = CycleSummary::default();

        if self.control.health_check_due(self.config.health_check_interval()) {
            self.health_check().await;
            if self.control.phase != Phase::Running {
                summary.skipped = true;
                return Ok(summary);
            }
        }

        self.apply_high_impact_news();
        {
            let risk = self.pipeline.risk_mut();
            risk.roll_day(Utc::now());
            risk.prune_restrictions();
        }

        let symbols = self.refresh_symbols().await?;
        summary.symbols = symbols.len();
        let (refreshed, errors) = self.refresh_market_data(&symbols).await;
        summary.symbol_errors = errors;
        if refreshed == 0 && !symbols.is_empty() {
            return Err(EngineError::MarketData {
                symbol: "*".to_string(),
                message: format!("refresh failed for all {} symbols", symbols.len()),
            });
        }

        self.mark_positions();
        summary.closed = self.manage_exits().await;

        if self.pipeline.risk().is_circuit_breaker_active() {
            debug!(
                reason = self.pipeline.risk().breaker_reason().unwrap_or_default(),
                "Circuit breaker active, skipping entries"
            );
        } else {
            let active = self.symbols.clone();
            summary.opened = self.evaluate_entries(&active).await;
        }

        self.performance.mark_unrealized(self.positions.open_pnl());
        Ok(summary)
    }

    // -- Health and connectivity ---------------------------------------------

    /// Probe every dependency. Unhealthy while Running pauses; healthy while
    /// paused for a non-manual reason resumes. A run of rejected orders
    /// counts against the execution venue.
    pub async fn health_check(&mut self) -> SystemHealth {
        let threshold = self.config.execution_failure_threshold;
        let orders_failing = self.health.execution_degraded(threshold);
        if orders_failing {
            warn!(
                streak = self.health.execution_failure_streak(),
                threshold,
                "Execution venue rejecting orders"
            );
        }
        let probe = DependencyProbe {
            data_source: self.market.is_healthy().await,
            execution_venue: self.executor.is_healthy().await && !orders_failing,
            sentiment_source: self.sentiment.is_healthy(),
        };
        let book = BookSnapshot {
            open_positions: self.positions.active_count(),
            daily_pnl: self.pipeline.risk().daily_pnl(),
            circuit_breaker_active: self.pipeline.risk().is_circuit_breaker_active(),
        };
        let health = self.health.assess(probe, book);
        self.control.mark_health_checked();
        if orders_failing {
            // The next check decides on the venue probe alone.
            self.health.clear_execution_streak();
        }
        self.journal(JournalEntry::Health {
            health: health.clone(),
        });

        if health.all_healthy() {
            debug!("Health check passed");
            if self.control.phase == Phase::Paused {
                self.resume(false);
            }
        } else {
            let components: Vec<String> = health
                .degraded_components()
                .into_iter()
                .map(str::to_string)
                .collect();
            warn!(components = ?components, "Health check failed");
            self.bus.publish(EngineEvent::HealthDegraded {
                components: components.clone(),
            });
            self.pause(PauseReason::Degraded(components));
        }
        health
    }

    pub async fn on_connectivity(&mut self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::Lost(component) => {
                warn!(component = %component, "Connection lost");
                self.health
                    .record_error("connectivity", &format!("{component} lost"));
                self.bus.publish(EngineEvent::ConnectionLost {
                    component: component.clone(),
                });
                self.pause(PauseReason::Connectivity(component));
            }
            ConnectivityEvent::Restored(component) => {
                info!(component = %component, "Connection restored");
                self.bus.publish(EngineEvent::ConnectionRestored {
                    component: component.clone(),
                });
                let health = self.health_check().await;
                if !health.all_healthy() {
                    info!(component = %component, "Still degraded after reconnect, staying paused");
                }
            }
        }
    }

    /// Pause trading. A manual reason overrides an automatic one.
    pub fn pause(&mut self, reason: PauseReason) {
        match self.control.phase {
            Phase::Running => {
                if self.transition(Trigger::Pause).is_ok() {
                    warn!(reason = %reason, "Trading paused");
                    self.bus.publish(EngineEvent::TradingPaused {
                        reason: reason.to_string(),
                    });
                    self.control.pause_reason = Some(reason);
                }
            }
            Phase::Paused => {
                if reason.is_manual() {
                    self.control.pause_reason = Some(reason);
                }
            }
            other => debug!(phase = %other, "Pause ignored"),
        }
        self.publish_status();
    }

    /// Resume trading. Automatic resumes never override a manual pause.
    pub fn resume(&mut self, manual: bool) -> bool {
        if self.control.phase != Phase::Paused {
            return false;
        }
        let manual_pause = self
            .control
            .pause_reason
            .as_ref()
            .map(PauseReason::is_manual)
            .unwrap_or(false);
        if manual_pause && !manual {
            debug!("Manual pause in effect, not auto-resuming");
            return false;
        }
        if self.transition(Trigger::Resume).is_err() {
            return false;
        }
        info!(manual, "Trading resumed");
        self.bus.publish(EngineEvent::TradingResumed);
        true
    }

    // -- Cycle steps ---------------------------------------------------------

    fn apply_high_impact_news(&mut self) {
        for alert in self.sentiment.take_high_impact() {
            self.pipeline.risk_mut().restrict_default(&alert.symbol);
        }
    }

    /// Active universe plus every symbol with an open position.
    async fn refresh_symbols(&mut self) -> Result<Vec<String>, EngineError> {
        let fetched = if self.config.symbols.is_empty() {
            self.market.get_active_symbols().await
        } else {
            Ok(self.config.symbols.clone())
        };
        match fetched {
            Ok(list) => {
                if list != self.symbols {
                    self.sentiment.track(&list);
                    self.symbols = list;
                }
            }
            Err(e) if self.symbols.is_empty() => {
                return Err(EngineError::MarketData {
                    symbol: "*".to_string(),
                    message: format!("active symbols unavailable: {e:#}"),
                });
            }
            Err(e) => {
                warn!(error = %e, cached = self.symbols.len(), "Using cached symbol list");
                self.health.record_error("symbols", &e);
            }
        }

        let mut all = self.symbols.clone();
        for symbol in self.positions.symbols() {
            if !all.contains(&symbol) {
                all.push(symbol);
            }
        }
        Ok(all)
    }

    async fn fetch_candle_set(&self, symbol: &str) -> anyhow::Result<CandleSet> {
        let cfg = self.pipeline.strategy().config();
        let limit = self.config.candle_limit;
        let (primary, entry, precision) = tokio::join!(
            self.market.get_candles(symbol, cfg.primary_timeframe, limit),
            self.market.get_candles(symbol, cfg.entry_timeframe, limit),
            self.market.get_candles(symbol, cfg.precision_timeframe, limit),
        );
        let primary = primary?;
        if primary.is_empty() {
            anyhow::bail!("no {} candles", cfg.primary_timeframe);
        }
        let entry = entry.unwrap_or_else(|e| {
            debug!(symbol, error = %e, "Entry timeframe unavailable");
            Vec::new()
        });
        let precision = precision.unwrap_or_else(|e| {
            debug!(symbol, error = %e, "Precision timeframe unavailable");
            Vec::new()
        });
        Ok(CandleSet::new(primary, entry, precision))
    }

    /// Returns `(refreshed, failed)`. Failed symbols keep their last candles.
    async fn refresh_market_data(&mut self, symbols: &[String]) -> (usize, usize) {
        let mut refreshed = 0;
        let mut failed = 0;
        for symbol in symbols {
            match self.fetch_candle_set(symbol).await {
                Ok(set) => {
                    self.candles.insert(symbol.clone(), set);
                    refreshed += 1;
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        symbol = %symbol,
                        step = "market_data",
                        error = %e,
                        "Market data refresh failed, keeping last candles"
                    );
                    self.health.record_error(&format!("market_data {symbol}"), &e);
                }
            }
        }
        (refreshed, failed)
    }

    fn mark_positions(&mut self) {
        let prices: HashMap<String, f64> = self
            .candles
            .iter()
            .filter_map(|(s, c)| c.latest_price().map(|p| (s.clone(), p)))
            .collect();
        self.positions.update_positions(&prices);
        let unrealized = self.positions.unrealized_pnl();
        self.pipeline.risk_mut().update_unrealized(unrealized);
        self.sync_risk();
    }

    async fn manage_exits(&mut self) -> usize {
        let mut closed = 0;
        for symbol in self.positions.symbols() {
            let Some(position) = self.positions.get(&symbol).cloned() else {
                continue;
            };
            let strategy_exit = self
                .candles
                .get(&symbol)
                .and_then(|c| self.pipeline.strategy().should_exit(&position, c));
            let decision = match strategy_exit {
                Some(why) => ExitDecision::Close(CloseReason::StrategyExit(why)),
                None => self.positions.evaluate_exit(&position),
            };

            match decision {
                ExitDecision::Hold => {}
                ExitDecision::Partial { levels, size } => {
                    self.take_partial(&position, &levels, size).await;
                }
                ExitDecision::Close(reason) => match self.close_position(&symbol, reason).await {
                    Ok(Some(_)) => closed += 1,
                    Ok(None) => {}
                    Err(e) => warn!(symbol = %symbol, step = "exit", error = %e, "Exit failed, will retry"),
                },
            }
        }
        self.sync_risk();
        closed
    }

    async fn take_partial(&mut self, position: &Position, levels: &[usize], size: f64) {
        let symbol = position.symbol.as_str();
        match self.executor.reduce(position, size, &CloseReason::TakeProfit).await {
            Ok(fill) => {
                self.health.record_execution_success();
                if let Some(pnl) = self.positions.apply_partial(symbol, levels, &fill) {
                    let unrealized = self.positions.unrealized_pnl();
                    self.pipeline.risk_mut().book_exit(pnl, unrealized);
                    self.bus.publish(EngineEvent::PartialExit {
                        symbol: symbol.to_string(),
                        size: fill.size,
                        price: fill.price,
                        pnl,
                    });
                    self.journal(JournalEntry::PartialExit {
                        symbol: symbol.to_string(),
                        size: fill.size,
                        price: fill.price,
                        pnl,
                    });
                }
            }
            Err(e) => {
                warn!(symbol, step = "take_profit", error = %e, "Partial exit failed");
                self.health.record_execution_failure(symbol, &e);
                self.bus.publish(EngineEvent::ExecutionFailed {
                    symbol: symbol.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Close the remainder of `symbol`. `Ok(None)` when there is nothing
    /// to close or a close is already in flight.
    async fn close_position(&mut self, symbol: &str, reason: CloseReason) -> Result<Option<ClosedTrade>, EngineError> {
        let Some(position) = self.positions.begin_close(symbol) else {
            return Ok(None);
        };
        match self.executor.close(&position, &reason).await {
            Ok(fill) => {
                self.health.record_execution_success();
                let Some(trade) = self.positions.close(symbol, fill.price, fill.fees, reason) else {
                    return Ok(None);
                };
                // Earlier partial exits were already booked with the risk manager.
                let unrealized = self.positions.unrealized_pnl();
                self.pipeline
                    .risk_mut()
                    .book_exit(trade.pnl - position.realized_pnl, unrealized);
                self.performance.record_trade(&trade);
                self.bus.publish(EngineEvent::PositionClosed {
                    symbol: trade.symbol.clone(),
                    side: trade.side,
                    exit_price: trade.exit_price,
                    pnl: trade.pnl,
                    pnl_percent: trade.pnl_percent,
                    reason: trade.reason.to_string(),
                });
                self.journal(JournalEntry::Closed {
                    trade: trade.clone(),
                    position: position.into_closed(trade.exit_price),
                });
                Ok(Some(trade))
            }
            Err(e) => {
                self.positions.abort_close(symbol);
                self.health.record_execution_failure(symbol, &e);
                self.bus.publish(EngineEvent::ExecutionFailed {
                    symbol: symbol.to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn evaluate_entries(&mut self, symbols: &[String]) -> usize {
        let mut opened = 0;
        for symbol in symbols {
            if self.positions.has_position(symbol) {
                continue;
            }
            let Some(candles) = self.candles.get(symbol) else {
                continue;
            };
            let sentiment = self.sentiment.get(symbol);
            let decision = self.pipeline.evaluate(symbol, candles, &sentiment);
            self.journal_decision(&decision);

            let DecisionRecord::Selected { signal, size } = decision else {
                continue;
            };
            let intent = OrderIntent::from_signal(&signal, size, self.pipeline.strategy().strategy_id());
            match self.executor.open(&intent).await {
                Ok(fill) => {
                    self.health.record_execution_success();
                    match self.positions.open(&intent, &fill) {
                        Ok(position) => {
                            opened += 1;
                            self.bus.publish(EngineEvent::PositionOpened {
                                symbol: position.symbol.clone(),
                                side: position.side,
                                size: position.size,
                                entry_price: position.entry_price,
                                stop_loss: position.stop_loss,
                            });
                            self.journal(JournalEntry::Opened { position });
                            self.sync_risk();
                        }
                        Err(e) => warn!(symbol = %symbol, error = %e, "Fill not recorded"),
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, step = "entry", error = %e, "Entry failed");
                    self.health.record_execution_failure(symbol, &e);
                    self.bus.publish(EngineEvent::ExecutionFailed {
                        symbol: symbol.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        opened
    }

    // -- Plumbing ------------------------------------------------------------

    fn transition(&mut self, trigger: Trigger) -> Result<Phase, EngineError> {
        let (from, to) = self.control.apply(trigger)?;
        if from != to {
            info!(from = %from, to = %to, trigger = %trigger, "Phase changed");
            self.bus.publish(EngineEvent::PhaseChanged { from, to });
        }
        self.publish_status();
        Ok(to)
    }

    fn sync_risk(&mut self) {
        let exposure = self.positions.exposure();
        self.pipeline.risk_mut().sync_exposure(exposure);
    }

    fn journal(&self, entry: JournalEntry) {
        if let Some(journal) = &self.journal {
            journal.record(entry);
        }
    }

    fn journal_decision(&self, decision: &DecisionRecord) {
        let (outcome, detail) = match decision {
            DecisionRecord::NoSetup { .. } => return,
            DecisionRecord::Selected { signal, size } => ("selected", format!("{signal}, size {size:.6}")),
            DecisionRecord::Filtered {
                technical_score,
                sentiment_coefficient,
                final_score,
                ..
            } => (
                "filtered",
                format!(
                    "technical {technical_score:.1} x sentiment {sentiment_coefficient:.2} = {final_score:.1}"
                ),
            ),
            DecisionRecord::RiskRejected { reason, .. } => ("risk_rejected", reason.to_string()),
            DecisionRecord::ZeroSize { signal } => ("zero_size", signal.to_string()),
        };
        self.journal(JournalEntry::Decision {
            symbol: decision.symbol().to_string(),
            outcome: outcome.to_string(),
            detail,
        });
    }

    fn publish_status(&self) {
        let risk = self.pipeline.risk();
        let now = Utc::now();
        let positions = self.positions.get_active_positions();
        let status = EngineStatus {
            phase: self.control.phase,
            pause_reason: self.control.pause_reason.as_ref().map(|r| r.to_string()),
            cycle_count: self.control.cycle_count,
            consecutive_errors: self.control.consecutive_errors,
            open_positions: positions.len(),
            positions,
            equity: risk.equity(),
            daily_pnl: risk.daily_pnl(),
            total_pnl: self.positions.get_total_pnl(),
            circuit_breaker_active: risk.is_circuit_breaker_active(),
            circuit_breaker_reason: risk.breaker_reason().map(str::to_string),
            health: self.health.last().cloned(),
            performance: self.performance.summary(now),
            started_at: self.control.started_at,
            last_cycle_at: self.control.last_cycle_at,
            updated_at: now,
        };
        self.status_tx.send_replace(status);
    }
}

fn startup(component: &str, e: anyhow::Error) -> EngineError {
    EngineError::Startup {
        component: component.to_string(),
        message: format!("{e:#}"),
    }
}
