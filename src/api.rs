use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use chrono::Local;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    engine::MediaEngine,
    error::ApiError,
    filename, format_selector,
    models::{
        DownloadJob, DownloadPayload, DownloadResponse, FormatsResponse, MediaFormat, Quality,
    },
    orchestrator::DownloadOrchestrator,
    picker,
    progress::ProgressRecord,
    validation,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn MediaEngine>,
    pub orchestrator: DownloadOrchestrator,
    pub download_dir: Arc<PathBuf>,
}

pub fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/formats", get(list_formats))
        .route("/download", post(start_download))
        .route("/progress/{filename}", get(get_progress))
        .route("/select_directory", get(select_directory))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({"message": "Video Downloader API"}))
}

async fn list_formats() -> Json<FormatsResponse> {
    Json(FormatsResponse {
        formats: MediaFormat::ALL.to_vec(),
        qualities: Quality::ALL.to_vec(),
    })
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadPayload>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let request = validation::validate_request(payload, &state.download_dir).await?;
    let info = state.engine.extract(&request.url).await?;
    let stream = format_selector::select(&info.formats, request.format, request.quality)?;

    let title = info
        .title
        .clone()
        .unwrap_or_else(|| "Unknown Title".to_string());
    let local_filename = filename::derive(
        &title,
        request.format.extension(),
        Local::now().naive_local(),
    );
    let save_path = request.save_dir.to_string_lossy().into_owned();
    let record = ProgressRecord::preparing(save_path.clone());

    state
        .orchestrator
        .progress()
        .init(local_filename.clone(), record.clone())
        .await;

    info!(
        "Accepted {} as {} ({} {})",
        request.url, local_filename, request.format, request.quality
    );

    let response = DownloadResponse {
        title,
        author: info
            .uploader
            .clone()
            .unwrap_or_else(|| "Unknown Author".to_string()),
        length: info.duration.unwrap_or_default(),
        views: info.view_count.unwrap_or_default(),
        thumbnail_url: info.thumbnail.clone().unwrap_or_default(),
        download_url: stream.direct_url.clone(),
        is_short: validation::is_short_url(&request.url),
        resolution: stream.resolution_label(),
        filesize: stream.filesize.unwrap_or_default(),
        ext: request.format.extension().to_string(),
        local_filename: local_filename.clone(),
        save_path,
        download_progress: record.progress,
        download_speed: record.speed,
        download_eta: record.eta,
        download_status: record.status,
    };

    state.orchestrator.submit(DownloadJob {
        url: request.url,
        format: request.format,
        stream,
        save_dir: request.save_dir,
        filename: local_filename,
    });

    Ok(Json(response))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<ProgressRecord>, ApiError> {
    let record = state.orchestrator.progress().get(&filename).await?;
    Ok(Json(record))
}

async fn select_directory() -> Json<serde_json::Value> {
    let path = picker::pick_directory().await.unwrap_or_default();
    Json(serde_json::json!({ "path": path }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        engine::{EngineError, TransferEvent},
        models::{CandidateStream, VideoInfo},
        progress::{DownloadStatus, ProgressTable},
    };

    struct FakeEngine {
        info: Result<VideoInfo, &'static str>,
    }

    #[async_trait]
    impl MediaEngine for FakeEngine {
        async fn extract(&self, _url: &str) -> Result<VideoInfo, EngineError> {
            self.info
                .clone()
                .map_err(|message| EngineError::Rejected(message.to_string()))
        }

        async fn download(
            &self,
            _job: &DownloadJob,
            events: mpsc::Sender<TransferEvent>,
        ) -> Result<(), EngineError> {
            let _ = events
                .send(TransferEvent::Progress {
                    downloaded_bytes: 512,
                    total_bytes: Some(1024),
                    speed: Some(2048.0),
                    eta_seconds: Some(1.0),
                })
                .await;
            Ok(())
        }
    }

    fn sample_info() -> VideoInfo {
        VideoInfo {
            title: Some("Lo-fi: beats / to study?".to_string()),
            uploader: Some("Channel".to_string()),
            duration: Some(300),
            view_count: Some(42),
            thumbnail: Some("https://i.ytimg.com/vi/abc/hq.jpg".to_string()),
            formats: vec![
                CandidateStream {
                    format_id: "137".to_string(),
                    extension: "mp4".to_string(),
                    height: Some(720),
                    has_video: true,
                    direct_url: "https://cdn/137".to_string(),
                    ..Default::default()
                },
                CandidateStream {
                    format_id: "140".to_string(),
                    extension: "m4a".to_string(),
                    bitrate: Some(128.0),
                    has_audio: true,
                    direct_url: "https://cdn/140".to_string(),
                    filesize: Some(4_000_000),
                    ..Default::default()
                },
            ],
        }
    }

    fn state_with(info: Result<VideoInfo, &'static str>, download_dir: PathBuf) -> AppState {
        let engine: Arc<dyn MediaEngine> = Arc::new(FakeEngine { info });
        AppState {
            orchestrator: DownloadOrchestrator::new(Arc::clone(&engine), ProgressTable::new(), 4),
            engine,
            download_dir: Arc::new(download_dir),
        }
    }

    fn payload(format: &str, quality: &str, save_path: Option<String>) -> DownloadPayload {
        DownloadPayload {
            url: "https://www.youtube.com/watch?v=abc123".to_string(),
            format: Some(format.to_string()),
            quality: Some(quality.to_string()),
            save_path,
        }
    }

    async fn wait_for_terminal(state: &AppState, key: &str) -> ProgressRecord {
        for _ in 0..100 {
            let record = state.orchestrator.progress().get(key).await.unwrap();
            if matches!(record.status, DownloadStatus::Completed | DownloadStatus::Error) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download {key} never finished");
    }

    #[tokio::test]
    async fn download_returns_metadata_and_tracks_progress() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(Ok(sample_info()), dir.path().to_path_buf());

        let Json(response) =
            start_download(State(state.clone()), Json(payload("mp3", "best", None)))
                .await
                .unwrap();

        assert_eq!(response.title, "Lo-fi: beats / to study?");
        assert_eq!(response.author, "Channel");
        assert_eq!(response.resolution, "audio only");
        assert_eq!(response.download_url, "https://cdn/140");
        assert_eq!(response.filesize, 4_000_000);
        assert_eq!(response.ext, "mp3");
        assert_eq!(response.download_status, DownloadStatus::Preparing);
        assert!(!response.is_short);
        assert!(response.local_filename.starts_with("Lo-fi beats  to study_"));
        assert!(response.local_filename.ends_with(".mp3"));

        let record = wait_for_terminal(&state, &response.local_filename).await;
        assert_eq!(record.status, DownloadStatus::Completed);
        assert_eq!(record.progress, 100.0);

        let Json(polled) = get_progress(State(state), Path(response.local_filename))
            .await
            .unwrap();
        assert_eq!(polled, record);
    }

    #[tokio::test]
    async fn download_creates_missing_save_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new").join("folder");
        let state = state_with(Ok(sample_info()), dir.path().to_path_buf());

        let Json(response) = start_download(
            State(state),
            Json(payload(
                "mp4",
                "480p",
                Some(target.to_string_lossy().into_owned()),
            )),
        )
        .await
        .unwrap();

        assert!(target.is_dir());
        assert_eq!(response.save_path, target.to_string_lossy());
        assert_eq!(response.resolution, "720p");
    }

    #[tokio::test]
    async fn invalid_quality_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(Ok(sample_info()), dir.path().to_path_buf());

        let error = start_download(State(state), Json(payload("mp4", "8k", None)))
            .await
            .unwrap_err();

        assert_eq!(error.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn extraction_failure_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(Err("Unsupported URL"), dir.path().to_path_buf());

        let error = start_download(State(state), Json(payload("mp4", "best", None)))
            .await
            .unwrap_err();

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, Some("EXTRACTION_ERROR"));
    }

    #[tokio::test]
    async fn no_matching_stream_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = sample_info();
        info.formats.retain(|stream| stream.has_video);
        let state = state_with(Ok(info), dir.path().to_path_buf());

        let error = start_download(State(state), Json(payload("mp3", "best", None)))
            .await
            .unwrap_err();

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, Some("NO_SUITABLE_FORMAT"));
    }

    #[tokio::test]
    async fn unknown_progress_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(Ok(sample_info()), dir.path().to_path_buf());

        let error = get_progress(State(state), Path("missing.mp4".to_string()))
            .await
            .unwrap_err();

        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn formats_lists_supported_values() {
        let Json(body) = list_formats().await;

        assert_eq!(body.formats.len(), 4);
        assert_eq!(body.qualities.last(), Some(&Quality::Best));
    }
}
