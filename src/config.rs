use std::{collections::HashSet, path::PathBuf};

use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use url::Url;

use crate::error::ApiError;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;
const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const DEFAULT_YT_DLP_PATH: &str = "yt-dlp";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";

/// Settings resolved from the environment once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub max_concurrent_downloads: usize,
    pub download_dir: PathBuf,
    pub yt_dlp_path: String,
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let max_concurrent_downloads = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);
        let download_dir = read_string_env("DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        let yt_dlp_path =
            read_string_env("YT_DLP_PATH").unwrap_or_else(|| DEFAULT_YT_DLP_PATH.to_string());
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|value| parse_origin_list(&value))
            .unwrap_or_default();

        Self {
            bind_addr: resolve_bind_addr(),
            max_concurrent_downloads,
            download_dir,
            yt_dlp_path,
            allowed_origins,
        }
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_origin_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to the local frontend origins.");
        vec![
            "http://localhost:3000".to_string(),
            "http://127.0.0.1:3000".to_string(),
        ]
    } else {
        configured.to_vec()
    };

    let allowed_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin)
                .and_then(|normalized| HeaderValue::from_str(&normalized).ok())
                .ok_or_else(|| {
                    ApiError::internal(format!(
                        "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                    ))
                })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s)",
        allowed_origins.len()
    );

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any))
}

/// Reduces an origin to `scheme://host[:port]`. The url crate already
/// lowercases the host and drops the scheme's default port.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https")
        || parsed.path() != "/"
        || parsed.query().is_some()
        || parsed.fragment().is_some()
    {
        return None;
    }

    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
