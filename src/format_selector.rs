//! Picks the single stream to download for a requested format and quality.
//!
//! Matching runs in two tiers. The strict tier keeps pure audio streams for
//! audio targets and streams in the requested container for video targets.
//! The relaxed tier keeps only the audio/video presence requirement. A bounded
//! quality is tried against both tiers before any stream above the bound is
//! accepted. Selection fails only when no stream carries the required media
//! type at all.

use std::cmp::Ordering;

use thiserror::Error;
use tracing::debug;

use crate::models::{CandidateStream, MediaFormat, Quality};

#[derive(Debug, Error, PartialEq)]
pub enum SelectionError {
    #[error("No downloadable stream matches format {format} at quality {quality}")]
    NoSuitableFormat { format: MediaFormat, quality: Quality },
}

pub fn select(
    candidates: &[CandidateStream],
    format: MediaFormat,
    quality: Quality,
) -> Result<CandidateStream, SelectionError> {
    let strict = ranked(candidates, format, |stream| matches_strictly(stream, format));
    let relaxed = ranked(candidates, format, |stream| carries_required_media(stream, format));

    let bound = quality.max_height().filter(|_| !format.is_audio_only());
    let selected = match bound {
        None => strict
            .first()
            .map(|stream| (*stream, "strict"))
            .or_else(|| relaxed.first().map(|stream| (*stream, "relaxed"))),
        Some(bound) => within_bound(&strict, bound)
            .map(|stream| (stream, "strict"))
            .or_else(|| within_bound(&relaxed, bound).map(|stream| (stream, "relaxed")))
            .or_else(|| strict.last().map(|stream| (*stream, "strict, above bound")))
            .or_else(|| relaxed.last().map(|stream| (*stream, "relaxed, above bound"))),
    };

    match selected {
        Some((stream, tier)) => {
            debug!(
                "Selected stream {} ({}) on {tier} tier for {format} {quality}",
                stream.format_id, stream.extension
            );
            Ok(stream.clone())
        }
        None => Err(SelectionError::NoSuitableFormat { format, quality }),
    }
}

fn matches_strictly(stream: &CandidateStream, format: MediaFormat) -> bool {
    if format.is_audio_only() {
        stream.has_audio && !stream.has_video
    } else {
        stream.has_video && stream.extension.eq_ignore_ascii_case(format.extension())
    }
}

fn carries_required_media(stream: &CandidateStream, format: MediaFormat) -> bool {
    if format.is_audio_only() {
        stream.has_audio
    } else {
        stream.has_video
    }
}

/// Filters `candidates` into a tier, best first.
fn ranked(
    candidates: &[CandidateStream],
    format: MediaFormat,
    keep: impl Fn(&CandidateStream) -> bool,
) -> Vec<&CandidateStream> {
    let mut streams = candidates
        .iter()
        .filter(|stream| keep(*stream))
        .collect::<Vec<_>>();

    if format.is_audio_only() {
        streams.sort_by(|a, b| compare_bitrate_desc(a, b));
    } else {
        streams.sort_by(|a, b| {
            b.height
                .unwrap_or_default()
                .cmp(&a.height.unwrap_or_default())
                .then_with(|| compare_bitrate_desc(a, b))
        });
    }
    streams
}

fn within_bound<'a>(ranked: &[&'a CandidateStream], bound: u32) -> Option<&'a CandidateStream> {
    ranked
        .iter()
        .copied()
        .find(|stream| stream.height.is_some_and(|height| height <= bound))
}

fn compare_bitrate_desc(a: &CandidateStream, b: &CandidateStream) -> Ordering {
    b.bitrate
        .unwrap_or_default()
        .partial_cmp(&a.bitrate.unwrap_or_default())
        .unwrap_or(Ordering::Equal)
}
