use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Preparing,
    Downloading,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProgressRecord {
    pub progress: f64,
    pub speed: String,
    pub eta: String,
    pub status: DownloadStatus,
    pub error_message: Option<String>,
    pub save_path: String,
}

impl ProgressRecord {
    pub fn preparing(save_path: impl Into<String>) -> Self {
        Self {
            progress: 0.0,
            speed: String::new(),
            eta: String::new(),
            status: DownloadStatus::Preparing,
            error_message: None,
            save_path: save_path.into(),
        }
    }
}

/// Partial record; `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub progress: Option<f64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub status: Option<DownloadStatus>,
    pub error_message: Option<String>,
}

impl ProgressUpdate {
    fn apply(self, record: &mut ProgressRecord) {
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(speed) = self.speed {
            record.speed = speed;
        }
        if let Some(eta) = self.eta {
            record.eta = eta;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(message) = self.error_message {
            record.error_message = Some(message);
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ProgressError {
    #[error("No download is tracked under {0}")]
    UnknownKey(String),
}

/// Process-wide progress records keyed by output filename.
///
/// Records are never evicted. The lock is held only for the duration of a
/// single read or merge.
#[derive(Debug, Clone, Default)]
pub struct ProgressTable {
    records: Arc<Mutex<HashMap<String, ProgressRecord>>>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init(&self, key: impl Into<String>, record: ProgressRecord) {
        self.records.lock().await.insert(key.into(), record);
    }

    /// Merges `update` into the record for `key`. Returns `false` and drops
    /// the update when the key is unknown.
    pub async fn update(&self, key: &str, update: ProgressUpdate) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(key) {
            Some(record) => {
                update.apply(record);
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, key: &str) -> Result<ProgressRecord, ProgressError> {
        self.records
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ProgressError::UnknownKey(key.to_string()))
    }
}
