//! boxterm library
//!
//! Disposable sandbox containers for untrusted code and interactive
//! language shells, streamed to browser clients over WebSockets.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod container;
pub mod logging;
pub mod metrics;
pub mod models;

/// Application state shared across all handlers
pub struct AppState {
    pub languages: models::Languages,
    pub session_config: Arc<container::ContainerSessionConfig>,
    pub container_manager: Arc<container::ContainerManager>,
    pub active_sessions: AtomicU64,
}

impl AppState {
    pub fn new(
        config: &config::AppConfig,
        languages: models::Languages,
        container_manager: Arc<container::ContainerManager>,
    ) -> Self {
        let session_config = Arc::new(config.session.to_session_config());
        Self {
            languages,
            session_config,
            container_manager,
            active_sessions: AtomicU64::new(0),
        }
    }
}
