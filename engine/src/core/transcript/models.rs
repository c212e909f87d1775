//! Transcript Models
//!
//! Timestamped transcript segments as delivered by a transcript provider.

use serde::{Deserialize, Serialize};

use crate::core::{SegmentId, TimeSec, VideoId};

// =============================================================================
// Transcript Segment
// =============================================================================

/// A single segment of a transcript
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    /// Unique segment ID
    pub id: SegmentId,
    /// Video this segment belongs to
    pub video_id: VideoId,
    /// Start time in seconds
    pub start_sec: TimeSec,
    /// End time in seconds
    pub end_sec: TimeSec,
    /// Spoken text
    pub text: String,
    /// Language code (e.g., "en", "hi")
    pub language: Option<String>,
}

impl TranscriptSegment {
    /// Creates a segment whose id is derived from its position in the transcript
    pub fn new(video_id: &str, index: usize, start_sec: f64, end_sec: f64, text: &str) -> Self {
        Self {
            id: format!("{}:{:05}", video_id, index),
            video_id: video_id.to_string(),
            start_sec,
            end_sec,
            text: text.to_string(),
            language: None,
        }
    }

    /// Sets the language code
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    /// Returns the duration of this segment
    pub fn duration(&self) -> f64 {
        self.end_sec - self.start_sec
    }

    /// Whether the timing is usable for chunking
    pub fn is_well_formed(&self) -> bool {
        self.start_sec.is_finite()
            && self.end_sec.is_finite()
            && self.start_sec >= 0.0
            && self.end_sec >= self.start_sec
    }
}

// =============================================================================
// Transcript Model
// =============================================================================

/// Complete transcript for a video
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    /// Video this transcript belongs to
    pub video_id: VideoId,
    /// Language the provider supplied
    pub language: Option<String>,
    /// Transcript segments, ordered by start time
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Creates a new empty transcript
    pub fn new(video_id: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            language: None,
            segments: Vec::new(),
        }
    }

    /// Creates a transcript with segments
    pub fn with_segments(video_id: &str, segments: Vec<TranscriptSegment>) -> Self {
        Self {
            video_id: video_id.to_string(),
            language: None,
            segments,
        }
    }

    /// Sets the transcript language
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Drops malformed segments and orders the rest by start time.
    ///
    /// Returns the number of segments removed.
    pub fn sanitize(&mut self) -> usize {
        let before = self.segments.len();
        let video_id = self.video_id.clone();
        self.segments.retain(|s| {
            let keep = s.is_well_formed();
            if !keep {
                tracing::warn!(
                    video_id = %video_id,
                    segment_id = %s.id,
                    start_sec = s.start_sec,
                    end_sec = s.end_sec,
                    "Dropping malformed transcript segment"
                );
            }
            keep
        });
        self.segments
            .sort_by(|a, b| a.start_sec.total_cmp(&b.start_sec));
        before - self.segments.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_creation() {
        let segment = TranscriptSegment::new("vid", 3, 0.0, 5.0, "Hello world").with_language("en");

        assert_eq!(segment.id, "vid:00003");
        assert_eq!(segment.video_id, "vid");
        assert_eq!(segment.duration(), 5.0);
        assert_eq!(segment.language.as_deref(), Some("en"));
    }

    #[test]
    fn test_segment_well_formed() {
        assert!(TranscriptSegment::new("v", 0, 0.0, 0.0, "x").is_well_formed());
        assert!(!TranscriptSegment::new("v", 0, -1.0, 2.0, "x").is_well_formed());
        assert!(!TranscriptSegment::new("v", 0, 3.0, 2.0, "x").is_well_formed());
        assert!(!TranscriptSegment::new("v", 0, f64::NAN, 2.0, "x").is_well_formed());
    }

    #[test]
    fn test_sanitize_drops_and_orders() {
        let mut transcript = Transcript::with_segments(
            "vid",
            vec![
                TranscriptSegment::new("vid", 0, 4.0, 6.0, "Third"),
                TranscriptSegment::new("vid", 1, 3.0, 1.0, "Broken"),
                TranscriptSegment::new("vid", 2, 0.0, 2.0, "First"),
            ],
        );

        let removed = transcript.sanitize();

        assert_eq!(removed, 1);
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.segments[0].text, "First");
        assert_eq!(transcript.segments[1].text, "Third");
    }
}
