//! Persistence layer.
//!
//! Two stores, both plain files:
//! - a JSON snapshot of open positions, rewritten after every change and
//!   read back on startup
//! - an append-only JSON-lines journal of trades, decisions and health checks
//!
//! Callers treat writes as fire-and-forget: a failed write is logged and
//! never blocks trading decisions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::{ClosedTrade, Position, SystemHealth};

/// Default positions snapshot path.
const DEFAULT_POSITIONS_FILE: &str = "momentum_positions.json";

/// Save open positions to a JSON file.
pub fn save_positions(positions: &[Position], path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_POSITIONS_FILE);
    let json = serde_json::to_string_pretty(positions).context("Failed to serialise positions")?;

    std::fs::write(path, &json).context(format!("Failed to write positions to {path}"))?;

    debug!(path, count = positions.len(), "Positions saved");
    Ok(())
}

/// Load open positions from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_positions(path: Option<&str>) -> Result<Option<Vec<Position>>> {
    let path = path.unwrap_or(DEFAULT_POSITIONS_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved positions found, starting flat");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read positions from {path}"))?;

    let positions: Vec<Position> =
        serde_json::from_str(&json).context(format!("Failed to parse positions from {path}"))?;

    info!(path, count = positions.len(), "Positions loaded from disk");
    Ok(Some(positions))
}

/// Delete the positions file (for testing or reset).
pub fn delete_positions(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_POSITIONS_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete positions file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Opened {
        position: Position,
    },
    PartialExit {
        symbol: String,
        size: f64,
        price: f64,
        pnl: f64,
    },
    Closed {
        trade: ClosedTrade,
        /// The position as it stood when closed.
        position: Position,
    },
    Decision {
        symbol: String,
        outcome: String,
        detail: String,
    },
    Health {
        health: SystemHealth,
    },
    EmergencyStop {
        closed: usize,
        failed: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: JournalEntry,
}

/// Append-only JSON-lines log.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let line = JournalLine {
            at: Utc::now(),
            entry: entry.clone(),
        };
        let json = serde_json::to_string(&line).context("Failed to serialise journal entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open journal {}", self.path.display()))?;
        writeln!(file, "{json}")
            .with_context(|| format!("Failed to append to journal {}", self.path.display()))?;
        Ok(())
    }

    /// Append, logging instead of failing.
    pub fn record(&self, entry: JournalEntry) {
        if let Err(e) = self.append(&entry) {
            warn!(path = %self.path.display(), error = %e, "Journal write failed");
        }
    }

    /// Read every line back. Unparseable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<JournalLine>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read journal {}", self.path.display()))?;
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
