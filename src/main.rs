//! Momentum engine entry point.
//!
//! Loads configuration, initialises structured logging, wires the market
//! data provider, execution venue and sentiment sources into the
//! orchestrator, and runs the trading loop until Ctrl+C. A first Ctrl+C
//! stops gracefully and leaves positions open; a second one flattens
//! everything.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use momentum_engine::api;
use momentum_engine::config::{AppConfig, MarketProvider};
use momentum_engine::engine::executor::OrderExecutor;
use momentum_engine::engine::orchestrator::TradingOrchestrator;
use momentum_engine::engine::positions::PositionManager;
use momentum_engine::events::EventBus;
use momentum_engine::notify;
use momentum_engine::sentiment::sources::HttpFeedSource;
use momentum_engine::sentiment::{SentimentAggregator, SentimentSource};
use momentum_engine::storage::Journal;
use momentum_engine::strategy::momentum::MomentumStrategy;
use momentum_engine::strategy::risk::RiskManager;
use momentum_engine::strategy::StrategyPipeline;
use momentum_engine::venue::binance::BinanceFeed;
use momentum_engine::venue::paper::PaperVenue;
use momentum_engine::venue::replay::ReplayFeed;
use momentum_engine::venue::{ExecutionVenue, MarketDataProvider};

const CONFIG_PATH: &str = "config.toml";
/// How long shutdown waits for pending alerts.
const ALERT_DRAIN_GRACE: Duration = Duration::from_secs(10);

const BANNER: &str = r#"
 __  __                            _
|  \/  | ___  _ __ ___   ___ _ __ | |_ _   _ _ __ ___
| |\/| |/ _ \| '_ ` _ \ / _ \ '_ \| __| | | | '_ ` _ \
| |  | | (_) | | | | | |  __/ | | | |_| |_| | | | | | |
|_|  |_|\___/|_| |_| |_|\___|_| |_|\__|\__,_|_| |_| |_|

  Multi-timeframe momentum with sentiment confirmation
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();
    println!("{BANNER}");

    let cfg = if Path::new(CONFIG_PATH).exists() {
        AppConfig::load(CONFIG_PATH)?
    } else {
        warn!(path = CONFIG_PATH, "Config file not found, using defaults");
        AppConfig::default()
    };

    info!(
        provider = ?cfg.market.provider,
        dry_run = cfg.execution.dry_run,
        equity = format!("${:.2}", cfg.risk.initial_equity),
        cycle_secs = cfg.engine.cycle_interval_secs,
        "Momentum engine starting up"
    );
    if cfg.execution.dry_run {
        warn!("DRY RUN: orders are logged, not sent");
    }

    let bus = EventBus::default();

    // -- Collaborators ---------------------------------------------------

    let market = build_market(&cfg)?;
    let venue: Arc<dyn ExecutionVenue> =
        Arc::new(PaperVenue::new(cfg.execution.slippage_bps, cfg.execution.fee_rate));
    let executor = OrderExecutor::new(
        venue,
        cfg.execution.dry_run,
        Duration::from_secs(cfg.execution.timeout_secs),
    );

    let sentiment = Arc::new(
        SentimentAggregator::new(&cfg.sentiment, build_sentiment_sources(&cfg)?)
            .with_event_bus(bus.clone()),
    );

    let pipeline = StrategyPipeline::new(
        MomentumStrategy::new(cfg.strategy.clone()).with_event_bus(bus.clone()),
        RiskManager::new(cfg.risk.clone()).with_event_bus(bus.clone()),
    );

    let mut orchestrator = TradingOrchestrator::new(
        cfg.engine.clone(),
        market,
        executor,
        Arc::clone(&sentiment),
        pipeline,
        bus.clone(),
    )
    .with_positions(PositionManager::new().with_persistence(&cfg.storage.positions_path));
    if !cfg.storage.journal_path.is_empty() {
        orchestrator = orchestrator.with_journal(Journal::new(&cfg.storage.journal_path));
    }

    // -- Background tasks ------------------------------------------------

    let alerts = notify::spawn_alert_forwarder(&bus, notify::from_config(&cfg.alerts));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = if cfg.sentiment.enabled {
        let every = sentiment.refresh_interval().min(Duration::from_secs(60));
        Some(Arc::clone(&sentiment).spawn_refresher(every, shutdown_rx))
    } else {
        None
    };

    // -- Start and run ---------------------------------------------------

    orchestrator
        .start()
        .await
        .context("Trading orchestrator failed to start")?;

    let handle = orchestrator.handle();
    let api_task = cfg
        .api
        .enabled
        .then(|| api::spawn_api(handle.subscribe_status(), cfg.api.port));

    let mut run = tokio::spawn(async move {
        orchestrator.run().await;
    });

    info!("Entering trading loop. Press Ctrl+C to stop, twice to flatten and stop.");

    tokio::select! {
        _ = &mut run => {
            warn!("Trading loop ended on its own");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping after the current cycle");
            if let Err(e) = handle.stop().await {
                warn!(error = %e, "Stop command not delivered");
            }
            tokio::select! {
                _ = &mut run => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("Second shutdown signal, flattening all positions");
                    handle.emergency_stop();
                    if let Err(e) = (&mut run).await {
                        error!(error = %e, "Trading loop task failed");
                    }
                }
            }
        }
    }

    // -- Teardown --------------------------------------------------------

    let _ = shutdown_tx.send(true);
    if let Some(task) = refresher {
        let _ = task.await;
    }
    if let Some(task) = api_task {
        task.abort();
    }

    // The run task has ended and dropped the orchestrator; releasing the
    // last bus handles closes the channel so queued alerts can flush.
    drop(sentiment);
    drop(bus);
    notify::drain_alerts(alerts, ALERT_DRAIN_GRACE).await;

    let status = handle.status();
    info!(
        phase = %status.phase,
        cycles = status.cycle_count,
        open_positions = status.open_positions,
        equity = format!("${:.2}", status.equity),
        total_pnl = format!("${:.2}", status.total_pnl),
        "Momentum engine shut down cleanly."
    );
    Ok(())
}

fn build_market(cfg: &AppConfig) -> Result<Arc<dyn MarketDataProvider>> {
    let market: Arc<dyn MarketDataProvider> = match cfg.market.provider {
        MarketProvider::Replay => {
            info!(path = %cfg.market.replay_path, "Using replay market data");
            Arc::new(ReplayFeed::from_file(&cfg.market.replay_path)?)
        }
        MarketProvider::Binance => {
            info!("Using Binance market data");
            Arc::new(BinanceFeed::new(
                cfg.market.base_url.as_deref(),
                cfg.engine.symbols.clone(),
            )?)
        }
    };
    Ok(market)
}

fn build_sentiment_sources(cfg: &AppConfig) -> Result<Vec<Arc<dyn SentimentSource>>> {
    if !cfg.sentiment.enabled {
        info!("Sentiment disabled, every symbol reads neutral");
        return Ok(Vec::new());
    }
    let mut sources: Vec<Arc<dyn SentimentSource>> = Vec::new();
    for feed in &cfg.sentiment.feeds {
        let source = HttpFeedSource::from_config(feed)
            .with_context(|| format!("Invalid {} sentiment feed", feed.kind))?;
        sources.push(Arc::new(source));
    }
    if sources.is_empty() {
        warn!("No sentiment feeds configured, every symbol reads neutral");
    }
    Ok(sources)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("momentum_engine=info"));

    let json_logging = std::env::var("MOMENTUM_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
