//! Operator alerts.
//!
//! A forwarder task listens on the event bus and pushes the events an
//! operator must see (breaker trips, health degradation, emergency stops,
//! lost connections, outsized trades) to a `Notifier`. Delivery failures
//! are logged and dropped; alerting never feeds back into trading.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::events::{EngineEvent, EventBus};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Trades at or beyond these percentages are worth an alert.
const NOTABLE_WIN_PCT: f64 = 10.0;
const NOTABLE_LOSS_PCT: f64 = -5.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    /// Env var holding the bot token.
    pub telegram_token_env: String,
    /// Env var holding the destination chat id.
    pub telegram_chat_id_env: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            telegram_token_env: "TELEGRAM_BOT_TOKEN".to_string(),
            telegram_chat_id_env: "TELEGRAM_CHAT_ID".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifiers
// ---------------------------------------------------------------------------

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Telegram bot delivery via `sendMessage`.
pub struct TelegramNotifier {
    http: Client,
    token: SecretString,
    chat_id: String,
    base_url: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self {
            http,
            token: SecretString::new(token),
            chat_id,
            base_url: TELEGRAM_API.to_string(),
        })
    }

    /// Build from the env vars named in `config`. `None` when either is unset.
    pub fn from_config(config: &AlertsConfig) -> Option<Self> {
        let token = AppConfig::resolve_env(&config.telegram_token_env)?;
        let chat_id = AppConfig::resolve_env(&config.telegram_chat_id_env)?;
        match Self::new(token, chat_id) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                warn!(error = %e, "Telegram notifier unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token.expose_secret());
        let params = [
            ("chat_id", self.chat_id.as_str()),
            ("text", message),
            ("parse_mode", "HTML"),
        ];
        let resp = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .context("Telegram request failed")?;
        if !resp.status().is_success() {
            bail!("Telegram returned {}", resp.status());
        }
        debug!("Telegram alert delivered");
        Ok(())
    }
}

/// Fallback when no chat is configured: alerts go to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        warn!(alert = %message.replace('\n', " | "), "ALERT");
        Ok(())
    }
}

/// Telegram when configured and enabled, otherwise the log.
pub fn from_config(config: &AlertsConfig) -> Arc<dyn Notifier> {
    if config.enabled {
        if let Some(telegram) = TelegramNotifier::from_config(config) {
            info!("Telegram alerts enabled");
            return Arc::new(telegram);
        }
        info!(
            token_env = %config.telegram_token_env,
            "Telegram credentials not set, alerts go to the log"
        );
    }
    Arc::new(LogNotifier)
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Alert text for `event`, or `None` when the event is not alert-worthy.
pub fn format_alert(event: &EngineEvent) -> Option<String> {
    let msg = match event {
        EngineEvent::CircuitBreakerTripped { reason } => {
            format!("🛑 <b>CIRCUIT BREAKER TRIPPED</b>\n\n{reason}\nNew entries blocked until reset.")
        }
        EngineEvent::CircuitBreakerReset { operator } => {
            format!("✅ <b>Circuit breaker reset</b> by {operator}")
        }
        EngineEvent::HealthDegraded { components } => {
            format!("⚠️ <b>HEALTH DEGRADED</b>\n\nUnhealthy: {}", components.join(", "))
        }
        EngineEvent::ConnectionLost { component } => {
            format!("📡 <b>CONNECTION LOST</b>\n\n{component}\nTrading paused.")
        }
        EngineEvent::EmergencyStop { closed, failed } => {
            let tail = if *failed > 0 {
                format!("\n<b>{failed} position(s) could not be closed</b>")
            } else {
                String::new()
            };
            format!("🚨 <b>EMERGENCY STOP</b>\n\nClosed: {closed}{tail}")
        }
        EngineEvent::PositionClosed {
            symbol,
            side,
            exit_price,
            pnl,
            pnl_percent,
            reason,
        } if *pnl_percent >= NOTABLE_WIN_PCT || *pnl_percent <= NOTABLE_LOSS_PCT => {
            let emoji = if *pnl >= 0.0 { "🟢" } else { "🔴" };
            format!(
                "{emoji} <b>{side} {symbol} closed</b>\n\n\
                Exit: {exit_price:.4}\n\
                P&L: ${pnl:.2} ({pnl_percent:+.2}%)\n\
                Reason: {reason}"
            )
        }
        _ => return None,
    };
    Some(msg)
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Forward alert-worthy events until the bus closes.
pub fn spawn_alert_forwarder(bus: &EventBus, notifier: Arc<dyn Notifier>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(text) = format_alert(&event) else {
                        continue;
                    };
                    if let Err(e) = notifier.send(&text).await {
                        warn!(event = event.name(), error = %e, "Alert delivery failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Alert forwarder lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Alert forwarder stopped");
    })
}

/// Wait up to `grace` for the forwarder to flush queued alerts, then abort
/// it. The forwarder only finishes once every `EventBus` clone is dropped.
/// Returns whether it finished on its own.
pub async fn drain_alerts(mut forwarder: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut forwarder).await {
        Ok(_) => true,
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "Alert forwarder still busy, aborting");
            forwarder.abort();
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
