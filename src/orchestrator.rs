use std::sync::Arc;

use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    engine::{EngineError, MediaEngine, TransferEvent},
    models::DownloadJob,
    progress::{DownloadStatus, ProgressTable, ProgressUpdate},
};

const EVENT_BUFFER: usize = 64;
const BYTES_PER_MIB: f64 = 1_048_576.0;
const UNKNOWN_SPEED: &str = "--";
const UNKNOWN_ETA: &str = "--:--";

const UNAVAILABLE_MESSAGE: &str = "This video is unavailable or has been removed.";
const AUTH_REQUIRED_MESSAGE: &str = "This video requires authentication to download.";
const GENERIC_REJECTION_MESSAGE: &str = "The video could not be downloaded from its source.";
const WORKER_FAULT_MESSAGE: &str = "The download stopped unexpectedly.";

/// Runs transfers on a bounded pool and owns the table they report into.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    engine: Arc<dyn MediaEngine>,
    progress: ProgressTable,
    permits: Arc<Semaphore>,
}

impl DownloadOrchestrator {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        progress: ProgressTable,
        max_concurrent: usize,
    ) -> Self {
        Self {
            engine,
            progress,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn progress(&self) -> &ProgressTable {
        &self.progress
    }

    /// Queues `job` and returns at once. Jobs beyond the pool size wait for
    /// a free slot in submission order. An engine that panics still leaves an
    /// error record behind.
    pub fn submit(&self, job: DownloadJob) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let progress = self.progress.clone();
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    record_failure(&progress, &job.filename, "Download pool is shut down.").await;
                    return;
                }
            };

            run_transfer(engine, &progress, job).await;
        })
    }
}

async fn run_transfer(engine: Arc<dyn MediaEngine>, progress: &ProgressTable, job: DownloadJob) {
    info!("Starting download of {} into {:?}", job.filename, job.save_dir);

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
    let listener = {
        let progress = progress.clone();
        let key = job.filename.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                progress.update(&key, update_for_event(&event)).await;
            }
        })
    };

    // Engine panics surface here as a JoinError.
    let transfer = {
        let job = job.clone();
        tokio::spawn(async move { engine.download(&job, events_tx).await })
    };
    let outcome = transfer.await;
    if let Err(error) = listener.await {
        warn!("Progress listener for {} stopped early: {error}", job.filename);
    }

    match outcome {
        Ok(Ok(())) => {
            progress
                .update(
                    &job.filename,
                    ProgressUpdate {
                        progress: Some(100.0),
                        speed: Some(String::new()),
                        eta: Some(String::new()),
                        status: Some(DownloadStatus::Completed),
                        error_message: None,
                    },
                )
                .await;
            info!("Download of {} completed", job.filename);
        }
        Ok(Err(error)) => {
            warn!("Download of {} failed: {error}", job.filename);
            record_failure(progress, &job.filename, &describe_failure(&error)).await;
        }
        Err(error) => {
            warn!("Download worker for {} stopped abnormally: {error}", job.filename);
            record_failure(progress, &job.filename, WORKER_FAULT_MESSAGE).await;
        }
    }
}

async fn record_failure(progress: &ProgressTable, key: &str, message: &str) {
    progress
        .update(
            key,
            ProgressUpdate {
                status: Some(DownloadStatus::Error),
                error_message: Some(message.to_string()),
                ..Default::default()
            },
        )
        .await;
}

pub fn update_for_event(event: &TransferEvent) -> ProgressUpdate {
    match event {
        TransferEvent::Progress {
            downloaded_bytes,
            total_bytes,
            speed,
            eta_seconds,
        } => {
            let remaining = eta_seconds.or_else(|| {
                let total = (*total_bytes)?;
                let rate = speed.filter(|rate| *rate > 0.0)?;
                Some(total.saturating_sub(*downloaded_bytes) as f64 / rate)
            });

            ProgressUpdate {
                progress: Some(percent(*downloaded_bytes, *total_bytes)),
                speed: Some(format_speed(*speed)),
                eta: Some(format_eta(remaining)),
                status: Some(DownloadStatus::Downloading),
                error_message: None,
            }
        }
        TransferEvent::Processing => ProgressUpdate {
            progress: Some(100.0),
            speed: Some(String::new()),
            eta: Some(String::new()),
            status: Some(DownloadStatus::Processing),
            error_message: None,
        },
    }
}

pub fn percent(downloaded: u64, total: Option<u64>) -> f64 {
    let Some(total) = total.filter(|total| *total > 0) else {
        return 0.0;
    };
    let value = (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
    (value * 100.0).round() / 100.0
}

pub fn format_speed(bytes_per_second: Option<f64>) -> String {
    match bytes_per_second.filter(|rate| rate.is_finite() && *rate >= 0.0) {
        Some(rate) if rate >= BYTES_PER_MIB => format!("{:.2} MB/s", rate / BYTES_PER_MIB),
        Some(rate) => format!("{:.2} KB/s", rate / 1024.0),
        None => UNKNOWN_SPEED.to_string(),
    }
}

pub fn format_eta(seconds: Option<f64>) -> String {
    match seconds.filter(|value| value.is_finite() && *value > 0.0) {
        Some(value) => {
            let total = value.round() as u64;
            format!("{}:{:02}", total / 60, total % 60)
        }
        None => UNKNOWN_ETA.to_string(),
    }
}

const AUTH_HINTS: [&str; 8] = [
    "sign in",
    "login",
    "log in",
    "private video",
    "members-only",
    "members only",
    "age-restricted",
    "confirm your age",
];
const UNAVAILABLE_HINTS: [&str; 6] = [
    "unavailable",
    "removed",
    "deleted",
    "does not exist",
    "terminated",
    "no longer available",
];

/// User-facing text recorded for a failed transfer.
pub fn describe_failure(error: &EngineError) -> String {
    let EngineError::Rejected(reported) = error else {
        return error.to_string();
    };

    let lower = reported.to_ascii_lowercase();
    if mentions_any(&lower, &AUTH_HINTS) {
        AUTH_REQUIRED_MESSAGE.to_string()
    } else if mentions_any(&lower, &UNAVAILABLE_HINTS) {
        UNAVAILABLE_MESSAGE.to_string()
    } else {
        GENERIC_REJECTION_MESSAGE.to_string()
    }
}

fn mentions_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
