use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::{
    config::non_empty,
    error::ApiError,
    models::{DownloadPayload, DownloadRequest, MediaFormat, Quality},
};

const DEFAULT_FORMAT: MediaFormat = MediaFormat::Mp4;
const DEFAULT_QUALITY: Quality = Quality::P1080;
const WRITE_PROBE_NAME: &str = ".write_probe";

static VIDEO_URL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^https?://(?:www\.|m\.)?youtube\.com/watch\?(?:.*&)?v=[\w-]+",
        r"^https?://(?:www\.|m\.)?youtube\.com/v/[\w-]+",
        r"^https?://youtu\.be/[\w-]+",
        r"^https?://(?:www\.|m\.)?youtube\.com/embed/[\w-]+",
        r"^https?://(?:www\.|m\.)?youtube\.com/shorts/[\w-]+",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

pub fn is_supported_video_url(input: &str) -> bool {
    let Ok(parsed) = Url::parse(input) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    VIDEO_URL_PATTERNS
        .iter()
        .any(|pattern| pattern.is_match(input))
}

pub fn is_short_url(url: &str) -> bool {
    url.contains("/shorts/")
}

/// Checks url, format and quality, then resolves and prepares the save
/// directory.
pub async fn validate_request(
    payload: DownloadPayload,
    default_dir: &Path,
) -> Result<DownloadRequest, ApiError> {
    let url = payload.url.trim().to_string();
    if url.is_empty() {
        return Err(ApiError::validation("Enter a video URL before downloading."));
    }
    if !is_supported_video_url(&url) {
        return Err(ApiError::validation("Invalid YouTube URL format"));
    }

    let format = match payload.format.as_deref().and_then(non_empty) {
        Some(value) => value.parse::<MediaFormat>().map_err(ApiError::validation)?,
        None => DEFAULT_FORMAT,
    };
    let quality = match payload.quality.as_deref().and_then(non_empty) {
        Some(value) => value.parse::<Quality>().map_err(ApiError::validation)?,
        None => DEFAULT_QUALITY,
    };

    let save_dir = payload
        .save_path
        .as_deref()
        .and_then(non_empty)
        .map(PathBuf::from)
        .unwrap_or_else(|| default_dir.to_path_buf());
    prepare_save_dir(&save_dir).await?;

    Ok(DownloadRequest {
        url,
        format,
        quality,
        save_dir,
    })
}

/// Creates `dir` when missing and confirms a file can be written in it.
pub async fn prepare_save_dir(dir: &Path) -> Result<(), ApiError> {
    match tokio::fs::metadata(dir).await {
        Ok(metadata) if !metadata.is_dir() => {
            return Err(ApiError::validation(format!(
                "Save path {} is not a directory",
                dir.display()
            )));
        }
        Ok(_) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dir).await.map_err(|error| {
                ApiError::validation(format!(
                    "Could not create save path {}: {error}",
                    dir.display()
                ))
            })?;
        }
        Err(error) => {
            return Err(ApiError::validation(format!(
                "Could not access save path {}: {error}",
                dir.display()
            )));
        }
    }

    let probe = dir.join(WRITE_PROBE_NAME);
    tokio::fs::write(&probe, b"").await.map_err(|error| {
        ApiError::validation(format!(
            "Save path {} is not writable: {error}",
            dir.display()
        ))
    })?;
    if let Err(error) = tokio::fs::remove_file(&probe).await
        && error.kind() != ErrorKind::NotFound
    {
        tracing::warn!("Could not remove write probe {:?}: {error}", probe);
    }

    Ok(())
}
