//! API module for boxterm
//!
//! Provides endpoints for:
//! - Interactive terminals (`/term?lang=`)
//! - Running uploaded code (`/run?lang=`)
//! - Health checks and Prometheus metrics

mod error;
mod handlers;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub use error::ApiError;
pub use handlers::health::start_uptime_clock;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(crate::metrics::metrics_handler))
        // WebSocket session endpoints
        .route("/term", get(handlers::session::terminal))
        .route("/run", get(handlers::session::run))
        .with_state(state)
}
