// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The operator surface, all under `/api/v1/`:
//   GET  /health            liveness + state version
//   GET  /status            full engine snapshot (grid, spreads, risk, market)
//   GET  /alerts/drain      hand over and clear the alert ring
//   POST /monitor/confirm   answer the manual-closure prompt
//   POST /risk/unlock       clear the trading lock
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::EngineState;
use crate::monitor::Confirmation;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST API router with CORS middleware and shared state.
pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/alerts/drain", get(drain_alerts))
        .route("/api/v1/monitor/confirm", post(monitor_confirm))
        .route("/api/v1/risk/unlock", post(risk_unlock))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Status snapshot
// =============================================================================

async fn status(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.build_status())
}

// =============================================================================
// Alerts
// =============================================================================

async fn drain_alerts(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.drain_alerts())
}

// =============================================================================
// Manual-closure confirmation
// =============================================================================

#[derive(Deserialize)]
struct ConfirmRequest {
    action: Confirmation,
}

#[derive(Serialize)]
struct ConfirmResponse {
    accepted: bool,
    message: &'static str,
}

async fn monitor_confirm(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<ConfirmRequest>,
) -> impl IntoResponse {
    if state.monitor.confirm(request.action) {
        info!(action = ?request.action, "manual-closure confirmation received");
        (
            StatusCode::OK,
            Json(ConfirmResponse {
                accepted: true,
                message: "confirmation recorded",
            }),
        )
    } else {
        (
            StatusCode::CONFLICT,
            Json(ConfirmResponse {
                accepted: false,
                message: "no confirmation prompt is open",
            }),
        )
    }
}

// =============================================================================
// Risk unlock
// =============================================================================

#[derive(Serialize)]
struct UnlockResponse {
    trading_locked: bool,
}

async fn risk_unlock(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    state.risk.unlock_manual();
    state.increment_version();
    Json(UnlockResponse {
        trading_locked: state.risk.is_locked(),
    })
}
