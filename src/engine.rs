//! Boundary to the external extraction/download engine.
//!
//! `YtDlpEngine` drives the `yt-dlp` executable. Its JSON output is parsed
//! into private structs here and converted into [`VideoInfo`] and
//! [`CandidateStream`] before leaving the module.

use std::{io::ErrorKind, process::Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
    time::{Duration, timeout},
};
use tracing::{debug, warn};

use crate::models::{CandidateStream, DownloadJob, MediaFormat, VideoInfo};

const EXTRACT_TIMEOUT_SECONDS: u64 = 180;
const PROGRESS_MARKER: &str = "[progress]";
const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s";
const POSTPROCESSOR_PREFIXES: [&str; 5] = [
    "[ExtractAudio]",
    "[Merger]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
    "[FixupM3u8]",
];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is not installed. Install it and restart the service.")]
    NotInstalled(String),
    #[error("Could not start the download engine: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("The engine did not answer within {0} seconds")]
    Timeout(u64),
    /// The engine itself refused the resource and reported why.
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Failed(String),
    #[error("Could not read engine metadata: {0}")]
    InvalidMetadata(String),
}

/// One report from an in-flight transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed: Option<f64>,
        eta_seconds: Option<f64>,
    },
    /// The transfer finished and a post-processing step is running.
    Processing,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn extract(&self, url: &str) -> Result<VideoInfo, EngineError>;

    /// Runs the transfer to completion, sending one event per engine
    /// progress report.
    async fn download(
        &self,
        job: &DownloadJob,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<(), EngineError>;
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    view_count: Option<u64>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    url: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    format_note: Option<String>,
    tbr: Option<f64>,
    abr: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

impl From<YtDlpFormat> for CandidateStream {
    fn from(format: YtDlpFormat) -> Self {
        let has_video = codec_present(format.vcodec.as_deref());
        let has_audio = codec_present(format.acodec.as_deref());
        let bitrate = if has_audio && !has_video {
            format.abr.or(format.tbr)
        } else {
            format.tbr
        };

        Self {
            format_id: format.format_id,
            extension: format.ext.unwrap_or_default(),
            height: format.height,
            bitrate,
            has_audio,
            has_video,
            direct_url: format.url.unwrap_or_default(),
            filesize: format
                .filesize
                .or(format.filesize_approx)
                .filter(|size| *size > 0.0)
                .map(|size| size.round() as u64),
            format_note: format.format_note,
        }
    }
}

impl From<YtDlpVideoInfo> for VideoInfo {
    fn from(info: YtDlpVideoInfo) -> Self {
        Self {
            title: info.title.filter(|value| !value.trim().is_empty()),
            uploader: info.uploader,
            duration: info
                .duration
                .filter(|seconds| *seconds >= 0.0)
                .map(|seconds| seconds.round() as u64),
            view_count: info.view_count,
            thumbnail: info.thumbnail,
            formats: info.formats.into_iter().map(CandidateStream::from).collect(),
        }
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if value != "none" && !value.is_empty())
}

pub fn parse_video_info(stdout: &[u8]) -> Result<VideoInfo, EngineError> {
    serde_json::from_slice::<YtDlpVideoInfo>(stdout)
        .map(VideoInfo::from)
        .map_err(|error| EngineError::InvalidMetadata(error.to_string()))
}

pub struct YtDlpEngine {
    program: String,
}

impl YtDlpEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn spawn_error(&self, error: std::io::Error) -> EngineError {
        if error.kind() == ErrorKind::NotFound {
            EngineError::NotInstalled(self.program.clone())
        } else {
            EngineError::Spawn(error)
        }
    }
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    async fn extract(&self, url: &str) -> Result<VideoInfo, EngineError> {
        let command_future = Command::new(&self.program)
            .args(["-J", "--no-playlist", "--no-warnings", url])
            .stdin(Stdio::null())
            .output();
        let output = timeout(Duration::from_secs(EXTRACT_TIMEOUT_SECONDS), command_future)
            .await
            .map_err(|_| EngineError::Timeout(EXTRACT_TIMEOUT_SECONDS))?
            .map_err(|error| self.spawn_error(error))?;

        if !output.status.success() {
            return Err(failure_from_stderr(&output.stderr));
        }

        parse_video_info(&output.stdout)
    }

    async fn download(
        &self,
        job: &DownloadJob,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<(), EngineError> {
        let mut child = Command::new(&self.program)
            .args(build_download_args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| self.spawn_error(error))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Failed("engine stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Failed("engine stderr was not captured".to_string()))?;

        let stderr_reader = tokio::spawn(async move {
            let mut collected = Vec::new();
            let mut chunks = BufReader::new(stderr).split(b'\n');
            while let Ok(Some(chunk)) = chunks.next_segment().await {
                collected.extend_from_slice(&chunk);
                collected.push(b'\n');
            }
            collected
        });

        forward_transfer_events(stdout, &events, &job.filename).await?;

        let status = child
            .wait()
            .await
            .map_err(|error| EngineError::Failed(format!("yt-dlp did not exit cleanly: {error}")))?;
        let stderr = stderr_reader.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(failure_from_stderr(&stderr))
        }
    }
}

/// Reads engine stdout line by line and forwards progress and the first
/// post-processing marker as events. Lines that are not valid UTF-8 are
/// decoded lossily.
pub async fn forward_transfer_events<R>(
    output: R,
    events: &mpsc::Sender<TransferEvent>,
    key: &str,
) -> Result<(), EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut chunks = BufReader::new(output).split(b'\n');
    let mut processing_reported = false;
    while let Some(chunk) = chunks
        .next_segment()
        .await
        .map_err(|error| EngineError::Failed(format!("Could not read engine output: {error}")))?
    {
        let line = String::from_utf8_lossy(&chunk);
        let line = line.trim_end_matches('\r');
        let event = if let Some(event) = parse_progress_line(line) {
            event
        } else if !processing_reported && is_postprocessor_line(line) {
            processing_reported = true;
            TransferEvent::Processing
        } else {
            debug!("yt-dlp: {line}");
            continue;
        };

        if events.send(event).await.is_err() {
            warn!("Progress receiver for {key} went away");
        }
    }
    Ok(())
}

pub fn build_download_args(job: &DownloadJob) -> Vec<String> {
    let output_template = format!("{}.%(ext)s", literal_template_path(job));
    let format_id = job.stream.format_id.as_str();
    let target = job.format.extension();

    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
        "-o".to_string(),
        output_template,
    ];

    if job.format.is_audio_only() {
        args.extend([
            "-f".to_string(),
            format_id.to_string(),
            "-x".to_string(),
            "--audio-format".to_string(),
            target.to_string(),
            "--audio-quality".to_string(),
            "0".to_string(),
        ]);
    } else {
        let selector = if job.stream.has_audio {
            format_id.to_string()
        } else {
            format!("{format_id}+bestaudio/best")
        };
        args.push("-f".to_string());
        args.push(selector);

        if matches!(job.format, MediaFormat::Mp4 | MediaFormat::Webm) {
            args.push("--merge-output-format".to_string());
            args.push(target.to_string());
        }
        if !job.stream.extension.eq_ignore_ascii_case(target) {
            args.push("--recode-video".to_string());
            args.push(target.to_string());
        }
    }

    args.push(job.url.clone());
    args
}

/// The output path without extension, with `%` doubled so yt-dlp writes it
/// verbatim instead of reading it as a template field.
fn literal_template_path(job: &DownloadJob) -> String {
    job.save_dir
        .join(job.stem())
        .to_string_lossy()
        .replace('%', "%%")
}

/// Parses a line printed by [`PROGRESS_TEMPLATE`]; unknown values are `NA`.
pub fn parse_progress_line(line: &str) -> Option<TransferEvent> {
    let rest = line.trim().strip_prefix(PROGRESS_MARKER)?;
    let mut fields = rest.split_whitespace();
    let downloaded = parse_number(fields.next()?)?;
    let total = fields.next().and_then(parse_number);
    let estimate = fields.next().and_then(parse_number);
    let speed = fields.next().and_then(parse_number);
    let eta_seconds = fields.next().and_then(parse_number);

    Some(TransferEvent::Progress {
        downloaded_bytes: downloaded.max(0.0).round() as u64,
        total_bytes: total
            .or(estimate)
            .filter(|value| *value > 0.0)
            .map(|value| value.round() as u64),
        speed,
        eta_seconds,
    })
}

fn parse_number(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
}

fn is_postprocessor_line(line: &str) -> bool {
    let line = line.trim_start();
    POSTPROCESSOR_PREFIXES
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Turns captured stderr into an error, preferring the engine's own
/// `ERROR:` report.
pub fn failure_from_stderr(stderr: &[u8]) -> EngineError {
    let text = String::from_utf8_lossy(stderr);
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    if let Some(reported) = lines
        .iter()
        .rev()
        .find_map(|line| line.strip_prefix("ERROR:"))
    {
        return EngineError::Rejected(reported.trim().to_string());
    }

    EngineError::Failed(
        lines
            .last()
            .map(|line| line.to_string())
            .unwrap_or_else(|| "yt-dlp could not complete the operation".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn job(format: MediaFormat, stream: CandidateStream) -> DownloadJob {
        DownloadJob {
            url: "https://www.youtube.com/watch?v=abc123".to_string(),
            format,
            filename: format!("Clip_20240101_000000.{}", format.extension()),
            stream,
            save_dir: PathBuf::from("/tmp/out"),
        }
    }

    #[test]
    fn metadata_json_becomes_typed_candidates() {
        let json = br#"{
            "title": "Demo",
            "uploader": "Someone",
            "duration": 212.4,
            "view_count": 1000,
            "thumbnail": "https://i.ytimg.com/vi/abc/hq.jpg",
            "formats": [
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2",
                 "abr": 129.5, "tbr": 130.1, "url": "https://cdn/140", "filesize": 3400000},
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none",
                 "height": 1080, "tbr": 4400.0, "filesize_approx": 9000000.4},
                {"format_id": "sb0", "ext": "mhtml"}
            ]
        }"#;

        let info = parse_video_info(json).unwrap();
        assert_eq!(info.title.as_deref(), Some("Demo"));
        assert_eq!(info.duration, Some(212));
        assert_eq!(info.formats.len(), 3);

        let audio = &info.formats[0];
        assert!(audio.has_audio && !audio.has_video);
        assert_eq!(audio.bitrate, Some(129.5));
        assert_eq!(audio.filesize, Some(3_400_000));
        assert_eq!(audio.direct_url, "https://cdn/140");

        let video = &info.formats[1];
        assert!(video.has_video && !video.has_audio);
        assert_eq!(video.height, Some(1080));
        assert_eq!(video.bitrate, Some(4400.0));
        assert_eq!(video.filesize, Some(9_000_000));

        let storyboard = &info.formats[2];
        assert!(!storyboard.has_audio && !storyboard.has_video);
    }

    #[test]
    fn malformed_metadata_is_reported() {
        let error = parse_video_info(b"not json").unwrap_err();
        assert!(matches!(error, EngineError::InvalidMetadata(_)));
    }

    #[test]
    fn progress_lines_parse_with_unknown_fields() {
        assert_eq!(
            parse_progress_line("[progress] 1048576 4194304 NA 524288.5 6"),
            Some(TransferEvent::Progress {
                downloaded_bytes: 1_048_576,
                total_bytes: Some(4_194_304),
                speed: Some(524_288.5),
                eta_seconds: Some(6.0),
            })
        );
        assert_eq!(
            parse_progress_line("[progress] 2048 NA 8192.0 NA NA"),
            Some(TransferEvent::Progress {
                downloaded_bytes: 2048,
                total_bytes: Some(8192),
                speed: None,
                eta_seconds: None,
            })
        );
        assert_eq!(parse_progress_line("[download] Destination: x.mp4"), None);
        assert_eq!(parse_progress_line("[progress] NA NA NA NA NA"), None);
    }

    #[test]
    fn postprocessor_lines_are_detected() {
        assert!(is_postprocessor_line("[ExtractAudio] Destination: a.mp3"));
        assert!(is_postprocessor_line("[Merger] Merging formats into \"a.mp4\""));
        assert!(!is_postprocessor_line("[youtube] abc: Downloading webpage"));
    }

    #[tokio::test]
    async fn undecodable_output_lines_do_not_stop_the_transfer() {
        let mut output = Vec::new();
        output.extend_from_slice(b"[download] Destination: caf\xe9 \xff.webm\n");
        output.extend_from_slice(b"[progress] 512 1024 NA 256.0 2\r\n");
        output.extend_from_slice(b"[Merger] Merging formats into \"caf\xe9.mp4\"\n");
        output.extend_from_slice(b"[ExtractAudio] Destination: x.mp3\n");
        output.extend_from_slice(b"[progress] 1024 1024 NA NA NA");
        let (events_tx, mut events_rx) = mpsc::channel(8);

        forward_transfer_events(output.as_slice(), &events_tx, "clip.mp4")
            .await
            .unwrap();
        drop(events_tx);

        let mut received = Vec::new();
        while let Some(event) = events_rx.recv().await {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                TransferEvent::Progress {
                    downloaded_bytes: 512,
                    total_bytes: Some(1024),
                    speed: Some(256.0),
                    eta_seconds: Some(2.0),
                },
                TransferEvent::Processing,
                TransferEvent::Progress {
                    downloaded_bytes: 1024,
                    total_bytes: Some(1024),
                    speed: None,
                    eta_seconds: None,
                },
            ]
        );
    }

    #[test]
    fn audio_job_extracts_mp3() {
        let stream = CandidateStream {
            format_id: "140".to_string(),
            extension: "m4a".to_string(),
            has_audio: true,
            ..Default::default()
        };
        let args = build_download_args(&job(MediaFormat::Mp3, stream));

        let joined = args.join(" ");
        assert!(joined.contains("-f 140 -x --audio-format mp3 --audio-quality 0"));
        assert!(!joined.contains("--recode-video"));
        assert!(args.contains(&"/tmp/out/Clip_20240101_000000.%(ext)s".to_string()));
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=abc123");
    }

    #[test]
    fn percent_signs_in_names_are_escaped_for_the_template() {
        let stream = CandidateStream {
            format_id: "18".to_string(),
            extension: "mp4".to_string(),
            has_video: true,
            has_audio: true,
            ..Default::default()
        };
        let mut job = job(MediaFormat::Mp4, stream);
        job.filename = "100% Pure %(id)s_20240101_000000.mp4".to_string();
        job.save_dir = PathBuf::from("/tmp/50%off");

        let args = build_download_args(&job);

        assert!(args.contains(
            &"/tmp/50%%off/100%% Pure %%(id)s_20240101_000000.%(ext)s".to_string()
        ));
    }

    #[test]
    fn silent_video_job_merges_best_audio() {
        let stream = CandidateStream {
            format_id: "137".to_string(),
            extension: "mp4".to_string(),
            has_video: true,
            ..Default::default()
        };
        let joined = build_download_args(&job(MediaFormat::Mp4, stream)).join(" ");

        assert!(joined.contains("-f 137+bestaudio/best"));
        assert!(joined.contains("--merge-output-format mp4"));
        assert!(!joined.contains("--recode-video"));
    }

    #[test]
    fn container_mismatch_requests_recode() {
        let stream = CandidateStream {
            format_id: "18".to_string(),
            extension: "mp4".to_string(),
            has_video: true,
            has_audio: true,
            ..Default::default()
        };
        let joined = build_download_args(&job(MediaFormat::ThreeGp, stream)).join(" ");

        assert!(joined.contains("-f 18 "));
        assert!(joined.contains("--recode-video 3gp"));
        assert!(!joined.contains("--merge-output-format"));
    }

    #[test]
    fn stderr_error_line_becomes_rejection() {
        let stderr = b"WARNING: something\nERROR: [youtube] abc: Video unavailable\n";
        match failure_from_stderr(stderr) {
            EngineError::Rejected(message) => {
                assert_eq!(message, "[youtube] abc: Video unavailable")
            }
            other => panic!("unexpected error: {other:?}"),
        }

        match failure_from_stderr(b"") {
            EngineError::Failed(message) => assert!(message.contains("yt-dlp")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
