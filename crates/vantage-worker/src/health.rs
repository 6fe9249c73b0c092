//! Health and metrics HTTP endpoints (Axum).

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::WorkerMetrics;

pub struct HealthState {
    pub metrics: WorkerMetrics,
    pub ready: Arc<AtomicBool>,
    pub module: String,
    pub started_at: Instant,
}

impl HealthState {
    pub fn new(metrics: WorkerMetrics, module: impl Into<String>) -> Self {
        Self {
            metrics,
            ready: Arc::new(AtomicBool::new(true)),
            module: module.into(),
            started_at: Instant::now(),
        }
    }
}

pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<Arc<HealthState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "module": state.module,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn ready(State(state): State<Arc<HealthState>>) -> Result<&'static str, StatusCode> {
    if state.ready.load(Ordering::Relaxed) {
        Ok("OK")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> String {
    state.metrics.encode()
}
