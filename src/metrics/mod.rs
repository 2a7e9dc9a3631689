//! Prometheus metrics export
//!
//! Session and deploy counters, exposed on `/metrics`

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::AppState;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() -> Result<()> {
    METRICS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("boxterm_deploy_duration_seconds".to_string()),
                &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            )
            .context("Invalid histogram buckets")?
            .install_recorder()
            .context("Failed to install Prometheus recorder")
    })?;
    Ok(())
}

/// Record a session accepted after the WebSocket upgrade
pub fn record_session_started(language: &str, mode: &str) {
    counter!("boxterm_sessions_started_total", "language" => language.to_string(), "mode" => mode.to_string()).increment(1);
}

/// Record a session whose teardown has completed
pub fn record_session_finished(language: &str, mode: &str) {
    counter!("boxterm_sessions_finished_total", "language" => language.to_string(), "mode" => mode.to_string()).increment(1);
}

/// Record a deploy attempt
pub fn record_deploy(language: &str, mode: &str, duration_secs: f64, success: bool) {
    histogram!("boxterm_deploy_duration_seconds", "language" => language.to_string(), "mode" => mode.to_string()).record(duration_secs);

    if !success {
        counter!("boxterm_deploy_failures_total", "language" => language.to_string(), "mode" => mode.to_string()).increment(1);
    }
}

/// Record why the I/O phase of a session stopped
pub fn record_io_stopped(reason: &str) {
    counter!("boxterm_io_stopped_total", "reason" => reason.to_string()).increment(1);
}

/// Prometheus metrics endpoint handler
///
/// The active-sessions gauge is sampled from `AppState` at scrape time.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    gauge!("boxterm_active_sessions").set(state.active_sessions.load(Ordering::Relaxed) as f64);

    let body = METRICS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        body,
    )
}
