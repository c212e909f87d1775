//! ReelIndex Core Type Definitions
//!
//! Defines fundamental types used throughout the retrieval core.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{CoreError, CoreResult};

// =============================================================================
// ID Types
// =============================================================================

/// Video identifier as issued by the hosting platform (e.g. an 11-char YouTube id)
pub type VideoId = String;

/// Chunk identifier, derived deterministically from video id and chunk index
pub type ChunkId = String;

/// Transcript segment identifier
pub type SegmentId = String;

/// Background job identifier (ULID)
pub type JobId = String;

// =============================================================================
// Time Types
// =============================================================================

/// Time in seconds (floating point)
pub type TimeSec = f64;

/// Formats seconds as a display timestamp.
///
/// Produces `MM:SS` below one hour and `H:MM:SS` above it. Negative and
/// non-finite inputs render as `00:00`.
pub fn format_timestamp(seconds: TimeSec) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "00:00".to_string();
    }

    let total = seconds.floor() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Closed-open time window `[start_sec, end_sec)` within a video
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start_sec: TimeSec,
    pub end_sec: TimeSec,
}

impl TimeRange {
    /// Validates that both bounds are finite, non-negative and ordered
    pub fn new(start_sec: TimeSec, end_sec: TimeSec) -> CoreResult<Self> {
        if !start_sec.is_finite() || !end_sec.is_finite() || start_sec < 0.0 || end_sec <= start_sec {
            return Err(CoreError::ValidationError(format!(
                "Invalid time range: {}..{}",
                start_sec, end_sec
            )));
        }
        Ok(Self { start_sec, end_sec })
    }

    /// Whether `[start, end]` shares any time with this window.
    /// Zero-length spans count when they fall inside it.
    pub fn overlaps(&self, start: TimeSec, end: TimeSec) -> bool {
        start < self.end_sec && (end > self.start_sec || start >= self.start_sec)
    }
}

// =============================================================================
// Video Reference
// =============================================================================

/// A reference to a video, parsed from a URL or a bare id
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRef {
    /// Extracted video id
    pub video_id: VideoId,
    /// Original input (URL or id)
    pub source: String,
}

fn video_url_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?:youtube\.com/watch\?(?:[^#\s]*&)?v=|youtu\.be/)([A-Za-z0-9_-]+)",
            r"youtube\.com/embed/([A-Za-z0-9_-]+)",
            r"youtube\.com/v/([A-Za-z0-9_-]+)",
            r"youtube\.com/shorts/([A-Za-z0-9_-]+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn bare_id_pattern() -> Option<&'static Regex> {
    static BARE: OnceLock<Option<Regex>> = OnceLock::new();
    BARE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").ok())
        .as_ref()
}

impl VideoRef {
    /// Parses a video URL or bare video id.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidVideoUrl("empty input".to_string()));
        }

        for pattern in video_url_patterns() {
            if let Some(id) = pattern.captures(trimmed).and_then(|c| c.get(1)) {
                return Ok(Self {
                    video_id: id.as_str().to_string(),
                    source: trimmed.to_string(),
                });
            }
        }

        if bare_id_pattern().is_some_and(|re| re.is_match(trimmed)) {
            return Ok(Self {
                video_id: trimmed.to_string(),
                source: trimmed.to_string(),
            });
        }

        Err(CoreError::InvalidVideoUrl(trimmed.to_string()))
    }

    /// Creates a reference directly from a known id
    pub fn from_id(video_id: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            source: video_id.to_string(),
        }
    }
}

impl std::fmt::Display for VideoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.video_id)
    }
}

/// Builds the chunk id for the `index`-th chunk of a video.
pub fn chunk_id_for(video_id: &str, index: usize) -> ChunkId {
    format!("{}#{:05}", video_id, index)
}

// =============================================================================
// Tests
// =============================================================================
