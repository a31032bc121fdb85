//! # Ops Endpoint
//!
//! Served only when `ORACLE_HTTP_ADDR` is set.
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | GET | `/health` | liveness + uptime |
//! | GET | `/metrics` | Prometheus text exposition |
//! | GET | `/status` | state tracker snapshot |
//! | POST | `/reports/:id/reset` | clears a `Failed` report so retries resume |
//!
//! The reset route is the only write; it touches in-memory bookkeeping
//! and never the report store or the ledger.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::metrics::OracleMetrics;
use crate::state_tracker::{StateTracker, TrackerSnapshot};
use crate::unix_now;

// ════════════════════════════════════════════════════════════════════════════
// APP STATE
// ════════════════════════════════════════════════════════════════════════════

pub struct OpsState {
    pub tracker: Arc<StateTracker>,
    pub metrics: Arc<OracleMetrics>,
    pub program_id: String,
    /// Hex public key of the oracle signer.
    pub oracle: String,
    /// Unix seconds at startup.
    pub start_time: i64,
}

// ════════════════════════════════════════════════════════════════════════════
// RESPONSE TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    uptime_secs: i64,
}

#[derive(Serialize)]
struct StatusResp {
    program_id: String,
    oracle: String,
    failed_reports: usize,
    tracker: TrackerSnapshot,
}

#[derive(Serialize)]
struct ResetResp {
    report_id: String,
    reset: bool,
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

async fn health_handler(State(s): State<Arc<OpsState>>) -> Json<HealthResp> {
    Json(HealthResp {
        status: "ok",
        uptime_secs: unix_now().saturating_sub(s.start_time),
    })
}

async fn metrics_handler(State(s): State<Arc<OpsState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        s.metrics.to_prometheus(),
    )
}

async fn status_handler(State(s): State<Arc<OpsState>>) -> Json<StatusResp> {
    Json(StatusResp {
        program_id: s.program_id.clone(),
        oracle: s.oracle.clone(),
        failed_reports: s.tracker.failed_count(),
        tracker: s.tracker.snapshot(),
    })
}

async fn reset_handler(
    State(s): State<Arc<OpsState>>,
    Path(report_id): Path<String>,
) -> (StatusCode, Json<ResetResp>) {
    let reset = s.tracker.reset(&report_id);
    if reset {
        info!(report_id = %report_id, "operator reset");
    }
    let status = if reset {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(ResetResp { report_id, reset }))
}

pub fn build_router(state: Arc<OpsState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/reports/:id/reset", post(reset_handler))
        .with_state(state)
}

/// Serves the router until `shutdown` flips to `true`.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<OpsState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "ops endpoint listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
