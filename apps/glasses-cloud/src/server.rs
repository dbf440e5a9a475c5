use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    apps::AppRegistry,
    auth::{CredentialValidator, StaticCatalog},
    config::ServerConfig,
    registry::SessionRegistry,
    transcription::{DiscardingTranscriber, TranscriberFactory},
    user_session::SessionSnapshot,
    ws::{glasses_ws_handler, tpa_ws_handler},
};

/// Shared by every handler.
pub struct AppState {
    pub registry: SessionRegistry,
    pub validator: Arc<dyn CredentialValidator>,
    pub apps: Arc<dyn AppRegistry>,
    pub transcriber: Arc<dyn TranscriberFactory>,
    pub handshake_timeout: Duration,
    /// `None` when no recorder is installed, e.g. in tests.
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    glasses_connected: usize,
    sessions: Vec<SessionSnapshot>,
}

impl AppState {
    fn stats(&self) -> StatsResponse {
        let sessions = self.registry.snapshot();
        StatsResponse {
            active_sessions: sessions.len(),
            glasses_connected: sessions.iter().filter(|s| s.glasses_connected).count(),
            sessions,
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/glasses-ws", get(glasses_ws_handler))
        .route("/tpa-ws", get(tpa_ws_handler))
        .with_state(state)
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let catalog = Arc::new(StaticCatalog::from_credentials(&config.tpas));
    info!(registered_apps = catalog.len(), "loaded app catalog");

    let registry = SessionRegistry::new(config.session.clone());
    let state = Arc::new(AppState {
        registry: registry.clone(),
        validator: catalog.clone(),
        apps: catalog,
        transcriber: Arc::new(DiscardingTranscriber::new()),
        handshake_timeout: config.handshake_timeout,
        metrics: Some(metrics),
    });

    let shutdown = CancellationToken::new();
    let reaper = registry.spawn_reaper(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("glasses-cloud listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    shutdown.cancel();
    let _ = reaper.await;
    registry.terminate_all();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}
