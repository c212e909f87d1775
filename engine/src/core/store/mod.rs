//! Persistence Module
//!
//! Key-value style persistence for chunk/embedding data (keyed by chunk id)
//! and processed-video markers (keyed by video id). The backend is swappable
//! behind [`IndexStore`].

mod memory;
mod sqlite;

pub use memory::MemoryIndexStore;
pub use sqlite::SqliteIndexStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::chunking::Chunk;
use crate::core::index::IndexEntry;
use crate::core::{CoreError, CoreResult, VideoId};

// =============================================================================
// Stored Types
// =============================================================================

/// A chunk together with its embedding
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

impl StoredChunk {
    pub fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self { chunk, vector }
    }

    pub fn chunk_id(&self) -> &str {
        &self.chunk.chunk_id
    }

    pub fn video_id(&self) -> &str {
        &self.chunk.video_id
    }

    /// Builds the in-memory index entry for this chunk
    pub fn to_index_entry(&self) -> IndexEntry {
        IndexEntry::from_chunk(&self.chunk, self.vector.clone())
    }
}

/// Durable record that a video is fully indexed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMarker {
    pub video_id: VideoId,
    /// Chunks written together with this marker
    pub chunk_count: usize,
    /// Embedding model the chunks were embedded with
    pub embedding_model: String,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedMarker {
    pub fn new(video_id: &str, chunk_count: usize, embedding_model: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            chunk_count,
            embedding_model: embedding_model.to_string(),
            processed_at: Utc::now(),
        }
    }
}

// =============================================================================
// Store Trait
// =============================================================================

/// Persistence backend for chunks and processed markers.
///
/// Storage failures surface as [`CoreError::IndexUnavailable`] and leave the
/// store unchanged.
pub trait IndexStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    // -- Chunks (keyed by chunk id) -------------------------------------------

    fn get_chunk(&self, chunk_id: &str) -> CoreResult<Option<StoredChunk>>;

    fn has_chunk(&self, chunk_id: &str) -> CoreResult<bool>;

    /// Inserts chunks atomically; an existing id fails the whole call
    fn put_chunks(&self, chunks: &[StoredChunk]) -> CoreResult<()>;

    /// Chunks of one video, in insertion order
    fn chunks_for_video(&self, video_id: &str) -> CoreResult<Vec<StoredChunk>>;

    /// Every chunk, in insertion order
    fn all_chunks(&self) -> CoreResult<Vec<StoredChunk>>;

    /// Total stored chunks, without loading them
    fn chunk_count(&self) -> CoreResult<usize>;

    fn chunk_count_for_video(&self, video_id: &str) -> CoreResult<usize>;

    /// Videos that have at least one stored chunk
    fn videos_with_chunks(&self) -> CoreResult<Vec<VideoId>>;

    // -- Markers (keyed by video id) ------------------------------------------

    fn get_marker(&self, video_id: &str) -> CoreResult<Option<ProcessedMarker>>;

    fn has_marker(&self, video_id: &str) -> CoreResult<bool> {
        Ok(self.get_marker(video_id)?.is_some())
    }

    fn put_marker(&self, marker: &ProcessedMarker) -> CoreResult<()>;

    fn remove_marker(&self, video_id: &str) -> CoreResult<bool>;

    fn markers(&self) -> CoreResult<Vec<ProcessedMarker>>;

    // -- Composite ------------------------------------------------------------

    /// Deletes a video's chunks and marker, returning the chunk count removed
    fn delete_video(&self, video_id: &str) -> CoreResult<usize>;

    /// Writes a video's chunks and its marker as one atomic unit.
    ///
    /// Fails when the marker's chunk count does not match the chunks the
    /// video will have after the write.
    fn commit_video(&self, marker: &ProcessedMarker, chunks: &[StoredChunk]) -> CoreResult<()>;
}

/// Checks that every chunk in a commit belongs to the marker's video
pub(crate) fn check_commit(marker: &ProcessedMarker, chunks: &[StoredChunk]) -> CoreResult<()> {
    if let Some(stray) = chunks.iter().find(|c| c.video_id() != marker.video_id) {
        return Err(CoreError::ValidationError(format!(
            "chunk {} does not belong to video {}",
            stray.chunk_id(),
            marker.video_id
        )));
    }
    for stored in chunks {
        stored.chunk.validate()?;
    }
    Ok(())
}

pub(crate) fn count_mismatch(marker: &ProcessedMarker, actual: usize) -> CoreError {
    CoreError::ValidationError(format!(
        "marker for {} records {} chunks but {} would be stored",
        marker.video_id, marker.chunk_count, actual
    ))
}

// =============================================================================
// Tests
// =============================================================================
