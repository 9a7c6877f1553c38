use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    #[serde(rename = "mp4")]
    Mp4,
    #[serde(rename = "webm")]
    Webm,
    #[serde(rename = "mp3")]
    Mp3,
    #[serde(rename = "3gp")]
    ThreeGp,
}

impl MediaFormat {
    pub const ALL: [MediaFormat; 4] = [Self::Mp4, Self::Webm, Self::Mp3, Self::ThreeGp];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mp3 => "mp3",
            Self::ThreeGp => "3gp",
        }
    }

    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::Mp3)
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for MediaFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.extension() == value)
            .ok_or_else(|| {
                format!(
                    "Format must be one of {}",
                    Self::ALL.map(MediaFormat::extension).join(", ")
                )
            })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "best")]
    Best,
}

impl Quality {
    pub const ALL: [Quality; 5] = [Self::P360, Self::P480, Self::P720, Self::P1080, Self::Best];

    pub fn label(self) -> &'static str {
        match self {
            Self::P360 => "360p",
            Self::P480 => "480p",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
            Self::Best => "best",
        }
    }

    /// Height ceiling encoded by the label, `None` for `best`.
    pub fn max_height(self) -> Option<u32> {
        match self {
            Self::P360 => Some(360),
            Self::P480 => Some(480),
            Self::P720 => Some(720),
            Self::P1080 => Some(1080),
            Self::Best => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|quality| quality.label() == value)
            .ok_or_else(|| {
                format!(
                    "Quality must be one of {}",
                    Self::ALL.map(Quality::label).join(", ")
                )
            })
    }
}

/// Raw `POST /download` body before validation.
#[derive(Debug, Deserialize, Clone)]
pub struct DownloadPayload {
    pub url: String,
    pub format: Option<String>,
    pub quality: Option<String>,
    pub save_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format: MediaFormat,
    pub quality: Quality,
    pub save_dir: PathBuf,
}

/// One encoding option reported by the extraction engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CandidateStream {
    pub format_id: String,
    pub extension: String,
    pub height: Option<u32>,
    pub bitrate: Option<f64>,
    pub has_audio: bool,
    pub has_video: bool,
    pub direct_url: String,
    pub filesize: Option<u64>,
    pub format_note: Option<String>,
}

impl CandidateStream {
    pub fn resolution_label(&self) -> String {
        if let Some(height) = self.height.filter(|_| self.has_video) {
            return format!("{height}p");
        }
        if self.has_audio && !self.has_video {
            return "audio only".to_string();
        }
        self.format_note
            .clone()
            .filter(|note| !note.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<u64>,
    pub view_count: Option<u64>,
    pub thumbnail: Option<String>,
    pub formats: Vec<CandidateStream>,
}

/// Everything a worker needs to run one transfer.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub format: MediaFormat,
    pub stream: CandidateStream,
    pub save_dir: PathBuf,
    pub filename: String,
}

impl DownloadJob {
    /// Output name without the requested extension.
    pub fn stem(&self) -> &str {
        let suffix = format!(".{}", self.format.extension());
        self.filename
            .strip_suffix(suffix.as_str())
            .unwrap_or(&self.filename)
    }
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub title: String,
    pub author: String,
    pub length: u64,
    pub views: u64,
    pub thumbnail_url: String,
    pub download_url: String,
    pub is_short: bool,
    pub resolution: String,
    pub filesize: u64,
    pub ext: String,
    pub local_filename: String,
    pub save_path: String,
    pub download_progress: f64,
    pub download_speed: String,
    pub download_eta: String,
    pub download_status: crate::progress::DownloadStatus,
}

#[derive(Debug, Serialize)]
pub struct FormatsResponse {
    pub formats: Vec<MediaFormat>,
    pub qualities: Vec<Quality>,
}
