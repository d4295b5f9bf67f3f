//! Health check HTTP endpoint for process supervisors.
//!
//! `GET /health` reports lifecycle state, run mode and whether the agent is
//! able to act. Returns 503 while the agent cannot trade safely.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::coordination::ShutdownToken;
use crate::domain::LifecycleState;
use crate::error::{KeeperError, Result};
use crate::strategy::OrderLifecycleManager;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Overall status from the conditions that limit what the agent may do.
    /// A lost feed still allows exits; a halt or pending reconciliation
    /// blocks all new orders.
    pub fn assess(ready: bool, feed_lost: bool, halted: bool) -> Self {
        if !ready {
            HealthStatus::Unhealthy
        } else if feed_lost || halted {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    /// "dry_run" or "live"
    pub mode: &'static str,
    pub state: LifecycleState,
    pub ready: bool,
    pub feed_lost: bool,
    pub halted: bool,
    pub halt_reason: Option<String>,
}

/// Shared state behind the health routes
pub struct HealthState {
    manager: Arc<OrderLifecycleManager>,
    started_at: DateTime<Utc>,
    dry_run: bool,
}

impl HealthState {
    pub fn new(manager: Arc<OrderLifecycleManager>, dry_run: bool) -> Self {
        Self {
            manager,
            started_at: Utc::now(),
            dry_run,
        }
    }

    pub async fn get_health(&self) -> HealthResponse {
        let snapshot = self.manager.snapshot().await;
        let state = LifecycleState::derive(snapshot.position.as_ref(), snapshot.live_order.as_ref());
        let ready = self.manager.is_ready().await;
        let feed_lost = self.manager.prices().is_feed_lost();
        let halted = snapshot.risk.is_halted();
        let now = Utc::now();

        HealthResponse {
            status: HealthStatus::assess(ready, feed_lost, halted),
            timestamp: now,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            mode: if self.dry_run { "dry_run" } else { "live" },
            state,
            ready,
            feed_lost,
            halted,
            halt_reason: snapshot.risk.halted.map(|h| h.reason),
        }
    }
}

pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve `/health` on `addr` until shutdown is requested
pub async fn serve(addr: &str, state: Arc<HealthState>, mut token: ShutdownToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("health endpoint listening on {}", addr);

    axum::serve(listener, health_router(state))
        .with_graceful_shutdown(async move {
            token.wait_for_shutdown().await;
        })
        .await
        .map_err(|e| KeeperError::Other(anyhow::anyhow!("health server error: {}", e)))
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    (health.status.status_code(), Json(health))
}
