//! boxterm - sandboxed terminals over WebSockets
//!
//! This is the main entry point for the boxterm service.
//! It deploys Docker containers per client session and bridges their TTY.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use tokio::signal;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use boxterm::api::{create_router, start_uptime_clock};
use boxterm::config::AppConfig;
use boxterm::container::{ContainerManager, DockerEngine};
use boxterm::logging::init_logging;
use boxterm::models::Languages;
use boxterm::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level, config.log_file.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting boxterm"
    );

    // Initialize metrics system
    boxterm::metrics::init_metrics()?;
    info!("Prometheus metrics initialized");

    // Language table is read once and never changes
    let languages = Languages::load(&config.languages_file)?;
    info!(
        file = %config.languages_file.display(),
        languages = languages.len(),
        "Languages loaded"
    );

    // Connect to the container engine
    let engine = DockerEngine::connect().context("Failed to connect to Docker")?;
    let container_manager = Arc::new(ContainerManager::new(
        Arc::new(engine),
        std::time::Duration::from_secs(config.session.container_stop_timeout_secs),
    ));

    match container_manager.engine_version().await {
        Some(version) => info!(%version, "Container engine connected"),
        None => warn!("Container engine not reachable, sessions will fail until it is"),
    }

    if config.pull_images {
        info!(images = languages.images().len(), "Pulling images");
        container_manager
            .pull_images(&languages)
            .await
            .context("Failed to pull images")?;
    }

    // Create shared application state
    let state = Arc::new(AppState::new(&config, languages, container_manager));

    // Build the router with all routes and middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(x_request_id));

    start_uptime_clock();

    // Bind to address
    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.bind_addr()))?;
    info!(%addr, "Listening on");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("boxterm stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down...");
}
