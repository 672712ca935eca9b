//! Status API route handlers.
//!
//! All endpoints return JSON read from the orchestrator's status channel.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::engine::control::{EngineStatus, Phase};
use crate::types::{Position, SystemHealth};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ApiState {
    status: watch::Receiver<EngineStatus>,
}

impl ApiState {
    pub fn new(status: watch::Receiver<EngineStatus>) -> Self {
        Self { status }
    }

    pub fn snapshot(&self) -> EngineStatus {
        self.status.borrow().clone()
    }
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub phase: Phase,
    pub healthy: bool,
    pub pause_reason: Option<String>,
    pub consecutive_errors: u32,
    pub last_check: Option<SystemHealth>,
    pub updated_at: DateTime<Utc>,
}

impl HealthResponse {
    fn from_status(status: &EngineStatus) -> Self {
        let deps_ok = status.health.as_ref().map(|h| h.all_healthy()).unwrap_or(true);
        let active = matches!(status.phase, Phase::Running | Phase::Paused);
        Self {
            phase: status.phase,
            healthy: active && deps_ok,
            pause_reason: status.pause_reason.clone(),
            consecutive_errors: status.consecutive_errors,
            last_check: status.health.clone(),
            updated_at: status.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let resp = HealthResponse::from_status(&state.snapshot());
    let code = if resp.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(resp))
}

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.snapshot())
}

/// GET /api/positions
pub async fn get_positions(State(state): State<AppState>) -> Json<Vec<Position>> {
    Json(state.snapshot().positions)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
