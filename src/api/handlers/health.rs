//! Health check handler

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, Json};
use once_cell::sync::Lazy;

use crate::models::{HealthResponse, HealthStatus};
use crate::AppState;

/// Server start time for uptime calculation
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Start the uptime clock; call once before serving
pub fn start_uptime_clock() {
    Lazy::force(&START_TIME);
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let uptime = START_TIME.elapsed().as_secs();
    let active_sessions = state.active_sessions.load(Ordering::Relaxed);
    let engine_version = state.container_manager.engine_version().await;

    // Sessions cannot deploy without the engine
    let status = if engine_version.is_some() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        active_sessions,
        languages: state.languages.len(),
        engine_version,
    })
}
