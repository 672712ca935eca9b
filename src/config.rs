//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section is optional and falls back to its defaults. Secrets (API
//! keys, bot tokens) are referenced by env-var name in the config and
//! resolved at runtime via `resolve_env`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;

use crate::engine::orchestrator::EngineConfig;
use crate::notify::AlertsConfig;
use crate::sentiment::SentimentConfig;
use crate::strategy::momentum::MomentumConfig;
use crate::strategy::risk::RiskConfig;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub strategy: MomentumConfig,
    pub risk: RiskConfig,
    pub sentiment: SentimentConfig,
    pub market: MarketConfig,
    pub execution: ExecutionConfig,
    pub storage: StorageConfig,
    pub alerts: AlertsConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarketProvider {
    Replay,
    Binance,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketConfig {
    pub provider: MarketProvider,
    /// Candle file for the replay provider.
    pub replay_path: String,
    /// Override for the Binance REST endpoint.
    pub base_url: Option<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            provider: MarketProvider::Replay,
            replay_path: "data/replay.json".to_string(),
            base_url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Log orders instead of sending them to the venue.
    pub dry_run: bool,
    pub slippage_bps: f64,
    pub fee_rate: f64,
    pub timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            slippage_bps: 5.0,
            fee_rate: 0.001,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub positions_path: String,
    /// Empty disables the journal.
    pub journal_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            positions_path: "momentum_positions.json".to_string(),
            journal_path: "momentum_journal.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make sizing or the schedule meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.risk.initial_equity <= 0.0 {
            bail!("risk.initial_equity must be positive");
        }
        if self.risk.max_positions == 0 {
            bail!("risk.max_positions must be at least 1");
        }
        if self.engine.cycle_interval_secs == 0 {
            bail!("engine.cycle_interval_secs must be at least 1");
        }
        let ladder = &self.strategy;
        if ladder.take_profit_r.len() != ladder.take_profit_fractions.len() {
            bail!("strategy.take_profit_r and take_profit_fractions must have the same length");
        }
        if ladder.take_profit_fractions.iter().sum::<f64>() > 1.0 + 1e-9 {
            bail!("strategy.take_profit_fractions must not sum past 1.0");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Unset and empty variables both read as `None`.
    pub fn resolve_env(env_name: &str) -> Option<String> {
        std::env::var(env_name).ok().filter(|v| !v.trim().is_empty())
    }
}
