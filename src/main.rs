mod api;
mod artifact_store;
mod config;
mod error;
mod extractor;
mod models;
mod registry;
mod sweeper;

use std::sync::Arc;

use anyhow::Result;
use axum::{routing::get, Router};
use config::Config;
use extractor::{MediaExtractor, YtDlpExtractor};
use registry::JobRegistry;
use sweeper::ExpirySweeper;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<JobRegistry>,
    pub extractor: Arc<dyn MediaExtractor>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/download", get(api::download))
        .route("/jobs/{job_id}", get(api::get_job))
        .route("/jobs/{job_id}/file", get(api::download_job_file))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "video_fetch_api=info,tower_http=info".into()),
        )
        .init();

    let mut config = Config::from_env()?;
    config.download_dir = artifact_store::ensure_download_root(&config.download_dir).await?;
    info!(download_dir = %config.download_dir.display(), "Download directory ready");

    let registry = Arc::new(JobRegistry::new());
    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        extractor: Arc::new(YtDlpExtractor::from_config(&config)),
    };

    let sweeper = ExpirySweeper::from_config(registry, &config).start();

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("video-fetch-api listening on {}", config.bind_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.stop().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
