//! Chunking Module
//!
//! Groups ordered transcript segments into overlapping, duration-bounded
//! chunks. Chunks are the unit of embedding and indexing.
//!
//! Segments are never split. Chunk boundaries and the overlap between
//! adjacent chunks always fall on segment boundaries.

use serde::{Deserialize, Serialize};

use crate::core::transcript::TranscriptSegment;
use crate::core::{chunk_id_for, format_timestamp, ChunkId, CoreError, CoreResult, SegmentId, TimeSec, VideoId};

// =============================================================================
// Chunk Configuration
// =============================================================================

/// Duration bounds for chunk building
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkConfig {
    /// Minimum chunk duration (only the final chunk may be shorter)
    pub min_duration_sec: f64,
    /// Duration at which a chunk is closed
    pub max_duration_sec: f64,
    /// Target overlap between adjacent chunks
    pub overlap_sec: f64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_duration_sec: 10.0,
            max_duration_sec: 30.0,
            overlap_sec: 5.0,
        }
    }
}

impl ChunkConfig {
    /// Creates a config with explicit bounds
    pub fn new(min_duration_sec: f64, max_duration_sec: f64, overlap_sec: f64) -> Self {
        Self {
            min_duration_sec,
            max_duration_sec,
            overlap_sec,
        }
    }

    /// Checks that the bounds are usable
    pub fn validate(&self) -> CoreResult<()> {
        let all_finite = self.min_duration_sec.is_finite()
            && self.max_duration_sec.is_finite()
            && self.overlap_sec.is_finite();
        if !all_finite {
            return Err(CoreError::ValidationError(
                "chunk durations must be finite".to_string(),
            ));
        }
        if self.min_duration_sec < 0.0 || self.overlap_sec < 0.0 {
            return Err(CoreError::ValidationError(
                "chunk durations must be non-negative".to_string(),
            ));
        }
        if self.max_duration_sec <= 0.0 || self.min_duration_sec > self.max_duration_sec {
            return Err(CoreError::ValidationError(format!(
                "invalid chunk bounds: min {}s, max {}s",
                self.min_duration_sec, self.max_duration_sec
            )));
        }
        if self.overlap_sec >= self.max_duration_sec {
            return Err(CoreError::ValidationError(format!(
                "overlap {}s must be shorter than max duration {}s",
                self.overlap_sec, self.max_duration_sec
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Chunk
// =============================================================================

/// A duration-bounded, timestamp-tagged span of transcript text
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Deterministic chunk id (`{video_id}#{index:05}`)
    pub chunk_id: ChunkId,
    /// Owning video
    pub video_id: VideoId,
    /// Start of the first covered segment
    pub start_sec: TimeSec,
    /// Latest end among covered segments
    pub end_sec: TimeSec,
    /// In-order concatenation of the covered segments' text
    pub text: String,
    /// Covered segments, in order (never empty)
    pub source_segment_ids: Vec<SegmentId>,
}

impl Chunk {
    /// Returns the chunk duration
    pub fn duration(&self) -> f64 {
        self.end_sec - self.start_sec
    }

    /// Start time rendered as `MM:SS`
    pub fn timestamp(&self) -> String {
        format_timestamp(self.start_sec)
    }

    /// Checks timing and provenance
    pub fn validate(&self) -> CoreResult<()> {
        let bounds_ok = self.start_sec.is_finite()
            && self.end_sec.is_finite()
            && self.start_sec >= 0.0
            && self.end_sec >= self.start_sec;
        if !bounds_ok || self.source_segment_ids.is_empty() {
            return Err(CoreError::InvalidChunkBounds {
                chunk_id: self.chunk_id.clone(),
                start_sec: self.start_sec,
                end_sec: self.end_sec,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Chunk Builder
// =============================================================================

/// Greedy segment grouper.
///
/// A chunk keeps taking segments while its span stays within
/// `max_duration_sec`. A chunk still shorter than `min_duration_sec` takes the
/// next segment even past the max, so only the final chunk may be short. The
/// next chunk starts at the latest trailing segment that begins at or before
/// `end - overlap_sec`, which makes the overlap at least the target whenever
/// the segment layout allows it. The overlap shrinks when carrying it would
/// push the next chunk past the max.
#[derive(Clone, Debug, Default)]
pub struct ChunkBuilder {
    config: ChunkConfig,
}

impl ChunkBuilder {
    /// Creates a builder, rejecting unusable bounds
    pub fn new(config: ChunkConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Builds chunks for one video.
    ///
    /// `segments` must be well formed and ordered by start time (see
    /// `Transcript::sanitize`). Empty input yields no chunks.
    pub fn build(&self, video_id: &str, segments: &[TranscriptSegment]) -> CoreResult<Vec<Chunk>> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(bad) = segments.iter().find(|s| !s.is_well_formed()) {
            return Err(CoreError::InvalidChunkBounds {
                chunk_id: bad.id.clone(),
                start_sec: bad.start_sec,
                end_sec: bad.end_sec,
            });
        }
        if segments
            .windows(2)
            .any(|w| w[1].start_sec < w[0].start_sec)
        {
            return Err(CoreError::ValidationError(format!(
                "segments for {} are not ordered by start time",
                video_id
            )));
        }

        let n = segments.len();
        let mut chunks = Vec::new();
        let mut first = 0usize;

        loop {
            let last = self.extend_chunk(segments, first);
            let chunk = make_chunk(video_id, chunks.len(), &segments[first..=last]);
            chunk.validate()?;
            chunks.push(chunk);

            if last + 1 >= n {
                break;
            }
            first = self.next_start(segments, first, last);
        }

        tracing::debug!(
            video_id = %video_id,
            segment_count = n,
            chunk_count = chunks.len(),
            "Built transcript chunks"
        );

        Ok(chunks)
    }

    /// Returns the index of the last segment of the chunk starting at `first`.
    ///
    /// A chunk still under the minimum takes the next segment whole, even
    /// when that pushes it past the maximum.
    fn extend_chunk(&self, segments: &[TranscriptSegment], first: usize) -> usize {
        let max = self.config.max_duration_sec;
        let min = self.config.min_duration_sec;
        let mut last = first;

        while last + 1 < segments.len() {
            let current = span(segments, first, last);
            if current >= max {
                break;
            }
            let extended = span(segments, first, last + 1);
            if extended <= max || current < min {
                last += 1;
            } else {
                break;
            }
        }

        last
    }

    /// Picks the first segment of the chunk following `first..=last`.
    fn next_start(&self, segments: &[TranscriptSegment], first: usize, last: usize) -> usize {
        if last == first {
            return last + 1;
        }

        let threshold = span_end(segments, first, last) - self.config.overlap_sec;
        let mut start = ((first + 1)..=last)
            .rev()
            .find(|&i| segments[i].start_sec <= threshold)
            .unwrap_or(last);

        // Shrink the overlap while the carried segments and the next new
        // segment would not fit within the max.
        while start <= last && span(segments, start, last + 1) > self.config.max_duration_sec {
            start += 1;
        }

        start
    }
}

fn span_end(segments: &[TranscriptSegment], first: usize, last: usize) -> f64 {
    segments[first..=last]
        .iter()
        .map(|s| s.end_sec)
        .fold(f64::NEG_INFINITY, f64::max)
}

fn span(segments: &[TranscriptSegment], first: usize, last: usize) -> f64 {
    span_end(segments, first, last) - segments[first].start_sec
}

fn make_chunk(video_id: &str, index: usize, covered: &[TranscriptSegment]) -> Chunk {
    let start_sec = covered.first().map(|s| s.start_sec).unwrap_or(0.0);
    let end_sec = covered
        .iter()
        .map(|s| s.end_sec)
        .fold(start_sec, f64::max);
    let text = covered
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Chunk {
        chunk_id: chunk_id_for(video_id, index),
        video_id: video_id.to_string(),
        start_sec,
        end_sec,
        text,
        source_segment_ids: covered.iter().map(|s| s.id.clone()).collect(),
    }
}

// =============================================================================
// Tests
// =============================================================================
