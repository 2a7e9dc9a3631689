//! WebSocket session handlers

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, info_span, Instrument};

use crate::api::ApiError;
use crate::container::{ContainerSession, SessionMode};
use crate::metrics;
use crate::models::ContainerConfig;
use crate::AppState;

/// Query parameters shared by both session endpoints
#[derive(Debug, Deserialize)]
pub struct LanguageQuery {
    #[serde(default)]
    pub lang: String,
}

/// Interactive shell for a language
pub async fn terminal(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LanguageQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    upgrade(state, query.lang, SessionMode::Terminal, ws)
}

/// Upload one file of code, then run it
pub async fn run(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LanguageQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    upgrade(state, query.lang, SessionMode::Run, ws)
}

fn upgrade(
    state: Arc<AppState>,
    lang: String,
    mode: SessionMode,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Unknown languages are refused before any upgrade is attempted
    let Some(language) = state.languages.get(&lang) else {
        return ApiError::unsupported_language(&lang).into_response();
    };
    let container_config = match mode {
        SessionMode::Terminal => language.term.clone(),
        SessionMode::Run => language.run.clone(),
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, lang, mode, container_config))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    lang: String,
    mode: SessionMode,
    container_config: ContainerConfig,
) {
    let mut session = ContainerSession::new(
        socket,
        lang.clone(),
        mode,
        container_config,
        state.session_config.clone(),
        state.container_manager.clone(),
    );

    let span = info_span!(
        "session",
        session_id = %session.id(),
        language = %lang,
        mode = mode.as_str(),
    );

    async {
        state.active_sessions.fetch_add(1, Ordering::Relaxed);
        metrics::record_session_started(&lang, mode.as_str());
        info!("Session opened");

        session.serve().await;

        metrics::record_session_finished(&lang, mode.as_str());
        state.active_sessions.fetch_sub(1, Ordering::Relaxed);
        info!("Session closed");
    }
    .instrument(span)
    .await;
}
