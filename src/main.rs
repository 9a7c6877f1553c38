mod api;
mod config;
mod engine;
mod error;
mod filename;
mod format_selector;
mod models;
mod orchestrator;
mod picker;
mod progress;
mod validation;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::{
    api::AppState,
    config::AppConfig,
    engine::{MediaEngine, YtDlpEngine},
    error::ApiError,
    orchestrator::DownloadOrchestrator,
    progress::ProgressTable,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "video_fetch_api=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create download directory {:?}: {error}",
                config.download_dir
            ))
        })?;

    let engine: Arc<dyn MediaEngine> = Arc::new(YtDlpEngine::new(config.yt_dlp_path.clone()));
    let orchestrator = DownloadOrchestrator::new(
        Arc::clone(&engine),
        ProgressTable::new(),
        config.max_concurrent_downloads,
    );
    info!(
        "Download pool sized for {} concurrent transfer(s), saving to {:?}",
        config.max_concurrent_downloads, config.download_dir
    );

    let state = AppState {
        engine,
        orchestrator,
        download_dir: Arc::new(config.download_dir.clone()),
    };
    let cors = crate::config::build_cors_layer(&config.allowed_origins)?;
    let app = api::build_router(state, cors);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not bind {}: {error}",
                config.bind_addr
            ))
        })?;

    info!("Backend ready on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
