//! Orchestrator lifecycle: startup, cycles, error budget, connectivity,
//! circuit breaker, persistence and emergency stop.

use std::sync::Arc;
use std::time::Duration;

use momentum_engine::engine::control::Phase;
use momentum_engine::engine::executor::OrderExecutor;
use momentum_engine::engine::orchestrator::{Command, EngineConfig, TradingOrchestrator};
use momentum_engine::engine::positions::PositionManager;
use momentum_engine::events::{EngineEvent, EventBus};
use momentum_engine::sentiment::{SentimentAggregator, SentimentConfig};
use momentum_engine::storage::{self, Journal, JournalEntry};
use momentum_engine::strategy::momentum::{MomentumConfig, MomentumStrategy};
use momentum_engine::strategy::risk::{RiskConfig, RiskManager};
use momentum_engine::strategy::StrategyPipeline;
use momentum_engine::types::{CloseReason, EngineError, PositionStatus};
use momentum_engine::venue::ConnectivityEvent;

use crate::mocks::{uptrend, with_last_close, MockMarket, MockVenue};

fn engine_config() -> EngineConfig {
    EngineConfig {
        cycle_interval_secs: 1,
        emergency_retry_rounds: 2,
        emergency_retry_delay_ms: 0,
        ..EngineConfig::default()
    }
}

fn risk_config() -> RiskConfig {
    RiskConfig {
        max_portfolio_exposure: 1.0,
        ..RiskConfig::default()
    }
}

fn build(market: &Arc<MockMarket>, venue: &Arc<MockVenue>, bus: &EventBus) -> TradingOrchestrator {
    build_with(market, venue, bus, risk_config(), engine_config())
}

fn build_with(
    market: &Arc<MockMarket>,
    venue: &Arc<MockVenue>,
    bus: &EventBus,
    risk: RiskConfig,
    engine: EngineConfig,
) -> TradingOrchestrator {
    let risk = RiskManager::new(risk).with_event_bus(bus.clone());
    let pipeline = StrategyPipeline::new(MomentumStrategy::new(MomentumConfig::default()), risk);
    let sentiment = Arc::new(SentimentAggregator::new(&SentimentConfig::default(), Vec::new()));
    let executor = OrderExecutor::new(venue.clone(), false, Duration::from_secs(5));
    TradingOrchestrator::new(
        engine,
        market.clone(),
        executor,
        sentiment,
        pipeline,
        bus.clone(),
    )
}

fn temp_path(ext: &str) -> String {
    let mut p = std::env::temp_dir();
    p.push(format!("momentum_it_{}.{ext}", uuid::Uuid::new_v4()));
    p.to_string_lossy().to_string()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_market_connect_failure_stops_engine() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    market.fail_connect("exchange unreachable");
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());

    let err = orch.start().await.unwrap_err();
    match err {
        EngineError::Startup { component, message } => {
            assert_eq!(component, "market_data");
            assert!(message.contains("exchange unreachable"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(orch.phase(), Phase::Stopped);
}

#[tokio::test]
async fn test_venue_connect_failure_names_component() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    venue.fail_connect("bad credentials");
    let mut orch = build(&market, &venue, &EventBus::default());

    match orch.start().await {
        Err(EngineError::Startup { component, .. }) => assert_eq!(component, "execution_venue"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(orch.phase(), Phase::Stopped);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();
    assert!(matches!(
        orch.start().await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert_eq!(orch.phase(), Phase::Running);
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cycle_opens_position_and_publishes_events() {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &bus);

    orch.start().await.unwrap();
    orch.tick().await.unwrap();

    let position = orch.positions().get("SOLUSDT").unwrap();
    assert!((position.entry_price - 115.0).abs() < 1e-9);
    assert!(position.stop_loss < position.entry_price);
    assert_eq!(venue.fills().len(), 1);

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::PositionOpened { symbol, .. } if symbol == "SOLUSDT")));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::CycleCompleted { cycle: 1, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::PhaseChanged {
            to: Phase::Running,
            ..
        }
    )));
}

#[tokio::test]
async fn test_stop_loss_closes_position() {
    let bus = EventBus::default();
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &bus);
    orch.start().await.unwrap();
    orch.tick().await.unwrap();
    assert!(orch.positions().has_position("SOLUSDT"));

    let mut events = bus.subscribe();
    market.set_candles("SOLUSDT", with_last_close(uptrend(), 110.0));
    orch.tick().await.unwrap();

    let trades = orch.positions().closed_trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, CloseReason::StopLoss);
    assert!((trades[0].exit_price - 110.0).abs() < 1e-9);
    assert!(trades[0].pnl < 0.0);
    assert!(orch.pipeline().risk().daily_pnl() < 0.0);

    let closed = drain(&mut events).into_iter().find_map(|e| match e {
        EngineEvent::PositionClosed { reason, .. } => Some(reason),
        _ => None,
    });
    assert_eq!(closed.as_deref(), Some("stop loss"));
}

#[tokio::test]
async fn test_stop_out_inside_daily_limit_leaves_breaker_off() {
    // 75 risked over a 2.3 stop: ~32.6 units at 115, stopped at 110 for a
    // ~163 loss against a 250 limit. Counting the loss twice would trip it.
    let risk = RiskConfig {
        max_daily_loss: 0.025,
        ..risk_config()
    };
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let journal_path = temp_path("jsonl");
    let mut orch = build_with(&market, &venue, &EventBus::default(), risk, engine_config())
        .with_journal(Journal::new(&journal_path));
    orch.start().await.unwrap();
    orch.tick().await.unwrap();
    assert!(orch.positions().has_position("SOLUSDT"));

    market.set_candles("SOLUSDT", with_last_close(uptrend(), 110.0));
    orch.tick().await.unwrap();

    let trades = orch.positions().closed_trades();
    assert_eq!(trades.len(), 1);
    let loss = trades[0].pnl;
    assert!(loss < -150.0 && loss > -250.0, "loss {loss}");

    let risk = orch.pipeline().risk();
    assert!(!risk.is_circuit_breaker_active(), "{:?}", risk.breaker_reason());
    assert!((risk.daily_pnl() - loss).abs() < 1e-6);
    assert!((risk.equity() - (10_000.0 + loss)).abs() < 1e-6);

    let lines = Journal::new(&journal_path).read_all().unwrap();
    let closed = lines.iter().find_map(|l| match &l.entry {
        JournalEntry::Closed { position, .. } => Some(position.clone()),
        _ => None,
    });
    let closed = closed.expect("close not journaled");
    assert_eq!(closed.status, PositionStatus::Closed);
    assert!((closed.current_price - 110.0).abs() < 1e-9);
    let _ = std::fs::remove_file(&journal_path);
}

#[tokio::test]
async fn test_failed_symbol_keeps_others_trading() {
    let market = Arc::new(
        MockMarket::new()
            .with_symbol("SOLUSDT", uptrend())
            .with_symbol("ETHUSDT", Vec::new()),
    );
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();

    orch.tick().await.unwrap();
    assert_eq!(orch.control().consecutive_errors, 0);
    assert!(orch.positions().has_position("SOLUSDT"));
    assert!(orch
        .recent_errors()
        .iter()
        .any(|e| e.contains("market_data ETHUSDT")));
}

// ---------------------------------------------------------------------------
// Error budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_error_budget_stops_on_tenth_failure() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();
    market.set_error("exchange down");

    for n in 1..10 {
        orch.tick().await.unwrap();
        assert_eq!(orch.control().consecutive_errors, n);
        assert_eq!(orch.phase(), Phase::Running);
    }

    match orch.tick().await {
        Err(EngineError::ErrorBudgetExhausted(n)) => assert_eq!(n, 10),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(orch.phase(), Phase::Stopped);
}

#[tokio::test]
async fn test_clean_cycle_resets_error_budget() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();

    market.set_error("exchange down");
    for _ in 0..9 {
        orch.tick().await.unwrap();
    }
    assert_eq!(orch.control().consecutive_errors, 9);

    market.clear_error();
    orch.tick().await.unwrap();
    assert_eq!(orch.control().consecutive_errors, 0);
    assert_eq!(orch.control().cycle_count, 10);
    assert_eq!(orch.phase(), Phase::Running);
}

#[tokio::test]
async fn test_rejected_orders_degrade_venue_health() {
    let engine = EngineConfig {
        execution_failure_threshold: 3,
        ..engine_config()
    };
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build_with(&market, &venue, &EventBus::default(), risk_config(), engine);
    orch.start().await.unwrap();
    venue.set_error("order rejected: insufficient margin");

    // Each cycle retries the entry and fails.
    for _ in 0..3 {
        orch.tick().await.unwrap();
    }
    assert_eq!(orch.control().consecutive_errors, 0);
    assert!(!orch.positions().has_position("SOLUSDT"));

    let health = orch.health_check().await;
    assert!(!health.execution_venue);
    assert!(health.data_source);
    assert_eq!(orch.phase(), Phase::Paused);

    venue.clear_error();
    let health = orch.health_check().await;
    assert!(health.all_healthy());
    assert_eq!(orch.phase(), Phase::Running);
}

// ---------------------------------------------------------------------------
// Connectivity and pauses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connection_lost_pauses_and_restore_resumes() {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &bus);
    orch.start().await.unwrap();

    market.set_healthy(false);
    orch.on_connectivity(ConnectivityEvent::Lost("market_data".into()))
        .await;
    assert_eq!(orch.phase(), Phase::Paused);

    // Paused ticks run the due health check but neither fetch data nor trade.
    let calls = market.candle_calls();
    orch.tick().await.unwrap();
    assert_eq!(orch.phase(), Phase::Paused);
    assert_eq!(market.candle_calls(), calls);
    assert_eq!(orch.positions().active_count(), 0);

    market.set_healthy(true);
    orch.on_connectivity(ConnectivityEvent::Restored("market_data".into()))
        .await;
    assert_eq!(orch.phase(), Phase::Running);

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ConnectionLost { .. })));
    assert!(events.iter().any(|e| matches!(e, EngineEvent::TradingResumed)));
}

#[tokio::test]
async fn test_restore_while_unhealthy_stays_paused() {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &bus);
    orch.start().await.unwrap();

    orch.on_connectivity(ConnectivityEvent::Lost("market_data".into()))
        .await;
    market.set_healthy(false);
    orch.on_connectivity(ConnectivityEvent::Restored("market_data".into()))
        .await;
    assert_eq!(orch.phase(), Phase::Paused);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        EngineEvent::HealthDegraded { components } if components == &vec!["market_data".to_string()]
    )));

    market.set_healthy(true);
    orch.health_check().await;
    assert_eq!(orch.phase(), Phase::Running);
}

#[tokio::test]
async fn test_manual_pause_is_not_auto_resumed() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();

    orch.handle_command(Command::Pause).await;
    orch.on_connectivity(ConnectivityEvent::Lost("execution_venue".into()))
        .await;
    orch.on_connectivity(ConnectivityEvent::Restored("execution_venue".into()))
        .await;
    assert_eq!(orch.phase(), Phase::Paused);
    assert_eq!(orch.handle().status().pause_reason.as_deref(), Some("manual"));

    orch.handle_command(Command::Resume).await;
    assert_eq!(orch.phase(), Phase::Running);
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_breaker_blocks_entries_until_reset() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();

    orch.handle_command(Command::TripCircuitBreaker("operator halt".into()))
        .await;
    orch.tick().await.unwrap();
    assert_eq!(orch.positions().active_count(), 0);
    assert_eq!(orch.phase(), Phase::Running);
    assert!(orch.handle().status().circuit_breaker_active);

    orch.handle_command(Command::ResetCircuitBreaker("ops".into()))
        .await;
    orch.tick().await.unwrap();
    assert!(orch.positions().has_position("SOLUSDT"));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_positions_survive_restart() {
    let path = temp_path("json");
    let journal_path = temp_path("jsonl");
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());

    let mut first = build(&market, &venue, &EventBus::default())
        .with_positions(PositionManager::new().with_persistence(&path))
        .with_journal(Journal::new(&journal_path));
    first.start().await.unwrap();
    first.tick().await.unwrap();
    first.stop().await;
    assert_eq!(first.phase(), Phase::Stopped);

    let mut second = build(&market, &venue, &EventBus::default())
        .with_positions(PositionManager::new().with_persistence(&path));
    second.start().await.unwrap();
    assert!(second.positions().has_position("SOLUSDT"));

    // Restored position is held, not re-entered.
    second.tick().await.unwrap();
    assert_eq!(venue.fills().len(), 1);

    let lines = Journal::new(&journal_path).read_all().unwrap();
    assert!(lines
        .iter()
        .any(|l| matches!(l.entry, JournalEntry::Opened { .. })));
    assert!(lines
        .iter()
        .any(|l| matches!(l.entry, JournalEntry::Health { .. })));

    storage::delete_positions(Some(&path)).unwrap();
    let _ = std::fs::remove_file(&journal_path);
}

// ---------------------------------------------------------------------------
// Emergency stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_emergency_stop_reports_partial_failure() {
    let bus = EventBus::default();
    let market = Arc::new(
        MockMarket::new()
            .with_symbol("SOLUSDT", uptrend())
            .with_symbol("AVAXUSDT", uptrend()),
    );
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &bus);
    orch.start().await.unwrap();
    orch.tick().await.unwrap();
    assert_eq!(orch.positions().active_count(), 2);

    venue.fail_close("AVAXUSDT");
    let mut events = bus.subscribe();
    let report = orch.emergency_stop().await;

    assert_eq!(report.executed.len(), 1);
    assert_eq!(report.executed[0].symbol, "SOLUSDT");
    assert_eq!(report.executed[0].reason, CloseReason::EmergencyStop);
    assert_eq!(report.failed_symbols(), vec!["AVAXUSDT".to_string()]);
    assert_eq!(orch.phase(), Phase::Stopped);

    // One initial attempt plus two retry rounds.
    let avax_attempts = venue
        .close_attempts()
        .iter()
        .filter(|s| s.as_str() == "AVAXUSDT")
        .count();
    assert_eq!(avax_attempts, 3);
    assert!(orch.positions().has_position("AVAXUSDT"));

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, EngineEvent::EmergencyStop { closed: 1, failed: 1 })));
}

#[tokio::test]
async fn test_emergency_stop_preempts_run_loop() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();

    let handle = orch.handle();
    let mut status = handle.subscribe_status();
    let task = tokio::spawn(async move {
        orch.run().await;
        orch
    });

    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.open_positions == 1))
        .await
        .expect("position never opened")
        .unwrap();

    handle.emergency_stop();
    let orch = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("run loop did not exit")
        .unwrap();

    assert_eq!(orch.phase(), Phase::Stopped);
    assert_eq!(orch.positions().active_count(), 0);
    assert_eq!(handle.status().phase, Phase::Stopped);
    assert_eq!(venue.close_attempts(), vec!["SOLUSDT".to_string()]);
}

#[tokio::test]
async fn test_emergency_stop_recloses_interrupted_exit() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();
    orch.tick().await.unwrap();
    assert!(orch.positions().has_position("SOLUSDT"));

    // The next cycle stops out, and the venue hangs on that close.
    market.set_candles("SOLUSDT", with_last_close(uptrend(), 110.0));
    venue.slow_next_close(Duration::from_secs(30));

    let handle = orch.handle();
    let task = tokio::spawn(async move {
        orch.run().await;
        orch
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while venue.close_attempts().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stop-loss close never started");

    handle.emergency_stop();
    let orch = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("emergency stop did not pre-empt the cycle")
        .unwrap();

    assert_eq!(orch.phase(), Phase::Stopped);
    assert_eq!(orch.positions().active_count(), 0);
    let trades = orch.positions().closed_trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, CloseReason::EmergencyStop);
    assert_eq!(
        venue.close_attempts(),
        vec!["SOLUSDT".to_string(), "SOLUSDT".to_string()]
    );
}

#[tokio::test]
async fn test_stop_command_ends_run_loop_and_keeps_positions() {
    let market = Arc::new(MockMarket::new().with_symbol("SOLUSDT", uptrend()));
    let venue = Arc::new(MockVenue::new());
    let mut orch = build(&market, &venue, &EventBus::default());
    orch.start().await.unwrap();

    let handle = orch.handle();
    let mut status = handle.subscribe_status();
    let task = tokio::spawn(async move {
        orch.run().await;
        orch
    });

    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.open_positions == 1))
        .await
        .expect("position never opened")
        .unwrap();

    handle.stop().await.unwrap();
    let orch = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("run loop did not exit")
        .unwrap();

    assert_eq!(orch.phase(), Phase::Stopped);
    assert_eq!(orch.positions().active_count(), 1);
    assert!(venue.close_attempts().is_empty());

    drop(orch);
    assert!(handle.pause().await.is_err());
}
