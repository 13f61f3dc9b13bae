use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};

use crate::config::MIN_INTERVAL_MS;
use crate::gate::{GateStats, SecureGate};
use crate::monitor::ScanControl;
use crate::resource::{MemorySnapshot, ResourceGuard};
use crate::scheduler::StatusBoard;
use crate::transport::{MetricsSnapshot, TransportMetrics};
use crate::types::{Status, TargetSnapshot};

/// Handles to the running engine. Every field is a shared handle; handlers
/// never touch target state directly.
#[derive(Clone)]
pub struct AppState {
    control: Arc<ScanControl>,
    board: StatusBoard,
    metrics: Arc<TransportMetrics>,
    gate: SecureGate,
    guard: Arc<ResourceGuard>,
}

impl AppState {
    pub fn new(
        control: Arc<ScanControl>,
        board: StatusBoard,
        metrics: Arc<TransportMetrics>,
        gate: SecureGate,
        guard: Arc<ResourceGuard>,
    ) -> Self {
        Self {
            control,
            board,
            metrics,
            gate,
            guard,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: String, // "idle" | "scanning"
    pub scan_age_ms: Option<u64>,
    pub passes: u64,
    pub forced_stops: u64,
    pub interval_ms: u64,
    pub targets: usize,
    pub up: usize,
    pub down: usize,
    pub unknown: usize,
    pub metrics: MetricsSnapshot,
    pub gate: GateStats,
    pub memory: MemorySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalBody {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReply {
    pub accepted: bool,
    pub scanning: bool,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/targets", get(get_targets))
        .route("/interval", get(get_interval).put(put_interval))
        .route("/scan", post(post_scan))
        .route("/scan/stop", post(post_scan_stop))
        .route("/metrics/reset", post(post_metrics_reset))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `bind` until `shutdown` fires.
pub async fn serve(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "status API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("status API server failed")?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let targets = app.board.targets();
    let count = |s: Status| targets.iter().filter(|t| t.status == s).count();
    let report = StatusReport {
        state: if app.control.is_scanning() { "scanning" } else { "idle" }.into(),
        scan_age_ms: app.control.scan_age().map(|d| d.as_millis() as u64),
        passes: app.control.passes(),
        forced_stops: app.control.forced_stops(),
        interval_ms: app.control.interval().as_millis() as u64,
        targets: targets.len(),
        up: count(Status::Up),
        down: count(Status::Down),
        unknown: count(Status::Unknown),
        metrics: app.metrics.snapshot(),
        gate: app.gate.stats(),
        memory: app.guard.snapshot(),
    };
    (StatusCode::OK, Json(report))
}

async fn get_targets(State(app): State<AppState>) -> Json<Vec<TargetSnapshot>> {
    Json(app.board.targets())
}

async fn get_interval(State(app): State<AppState>) -> Json<IntervalBody> {
    Json(IntervalBody {
        interval_ms: app.control.interval().as_millis() as u64,
    })
}

async fn put_interval(
    State(app): State<AppState>,
    Json(body): Json<IntervalBody>,
) -> impl IntoResponse {
    if body.interval_ms < MIN_INTERVAL_MS {
        return (
            StatusCode::BAD_REQUEST,
            format!("interval_ms must be at least {MIN_INTERVAL_MS}"),
        )
            .into_response();
    }
    app.control.set_interval(Duration::from_millis(body.interval_ms));
    (StatusCode::OK, Json(body)).into_response()
}

async fn post_scan(State(app): State<AppState>) -> impl IntoResponse {
    let scanning = app.control.is_scanning();
    if !scanning {
        app.control.request_scan();
    }
    (
        StatusCode::ACCEPTED,
        Json(ScanReply {
            accepted: !scanning,
            scanning,
        }),
    )
}

async fn post_scan_stop(State(app): State<AppState>) -> impl IntoResponse {
    let stopped = app.control.force_stop();
    (
        StatusCode::OK,
        Json(ScanReply {
            accepted: stopped,
            scanning: app.control.is_scanning(),
        }),
    )
}

async fn post_metrics_reset(State(app): State<AppState>) -> StatusCode {
    app.metrics.reset();
    app.gate.reset_stats();
    tracing::info!("metrics reset by operator");
    StatusCode::NO_CONTENT
}
