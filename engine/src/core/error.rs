//! ReelIndex Error Definitions
//!
//! Defines error types used throughout the retrieval core.

use std::time::Duration;

use thiserror::Error;

use super::{ChunkId, TimeSec, VideoId};

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Transcript Errors
    // =========================================================================
    #[error("Transcript unavailable for {video_id}: {reason}")]
    TranscriptUnavailable { video_id: VideoId, reason: String },

    #[error("Invalid video URL: {0}")]
    InvalidVideoUrl(String),

    // =========================================================================
    // Chunking Errors
    // =========================================================================
    #[error("Invalid chunk bounds for {chunk_id}: {start_sec:.3}~{end_sec:.3}s")]
    InvalidChunkBounds {
        chunk_id: ChunkId,
        start_sec: TimeSec,
        end_sec: TimeSec,
    },

    // =========================================================================
    // Embedding Errors
    // =========================================================================
    #[error("Embedding request failed after {attempts} attempts: {message}")]
    EmbeddingTransient { attempts: u32, message: String },

    #[error("Embedding request rejected: {0}")]
    EmbeddingPermanent(String),

    #[error("Embedding quota exhausted, resets in {}s", .reset_in.as_secs())]
    QuotaExhausted { reset_in: Duration },

    // =========================================================================
    // Index Errors
    // =========================================================================
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Duplicate chunk id: {0}")]
    DuplicateChunk(ChunkId),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    // =========================================================================
    // Ingestion Errors
    // =========================================================================
    #[error("Ingestion failed for {video_id}: {reason}")]
    IngestionFailed { video_id: VideoId, reason: String },

    #[error("Invalid state transition for {video_id}: {from} -> {to}")]
    InvalidStateTransition {
        video_id: VideoId,
        from: String,
        to: String,
    },

    /// Raised for explicit cancellation and for expired deadlines
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Convert to a user-friendly error message for the boundary layer
    pub fn to_ipc_error(&self) -> String {
        self.to_string()
    }

    /// Errors that the embedding retry loop recovers from locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::EmbeddingTransient { .. } | CoreError::QuotaExhausted { .. }
        )
    }

    /// Configuration or data-shape errors. These are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CoreError::DimensionMismatch { .. }
                | CoreError::InvalidChunkBounds { .. }
                | CoreError::DuplicateChunk(_)
                | CoreError::InvalidStateTransition { .. }
        )
    }

    /// Wraps a pipeline error as an ingestion failure for `video_id`.
    ///
    /// Structural errors and cancellations keep their own variant so callers
    /// can still tell them apart.
    pub fn into_ingestion_failure(self, video_id: &str) -> Self {
        match self {
            e if e.is_structural() => e,
            e @ (CoreError::IngestionFailed { .. }
            | CoreError::Cancelled(_)
            | CoreError::TranscriptUnavailable { .. }
            | CoreError::IndexUnavailable(_)) => e,
            other => CoreError::IngestionFailed {
                video_id: video_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
