//! Processed Video Registry
//!
//! Durable record of which videos are fully indexed plus the in-flight set
//! that keeps two ingestions of one video from running at once. Locking is
//! per video id; the map lock is only held to look up a slot.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::store::{IndexStore, ProcessedMarker, StoredChunk};
use crate::core::{CoreError, CoreResult, VideoId};

// =============================================================================
// State
// =============================================================================

/// Processing state of one video
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum VideoProcessingState {
    #[default]
    Unprocessed,
    Processing,
    #[serde(rename_all = "camelCase")]
    Processed { chunk_count: usize },
    Failed { reason: String },
}

impl VideoProcessingState {
    pub fn name(&self) -> &'static str {
        match self {
            VideoProcessingState::Unprocessed => "unprocessed",
            VideoProcessingState::Processing => "processing",
            VideoProcessingState::Processed { .. } => "processed",
            VideoProcessingState::Failed { .. } => "failed",
        }
    }

    /// Allowed moves: `Unprocessed|Failed -> Processing` and
    /// `Processing -> Processed|Failed`.
    pub fn can_transition_to(&self, next: &VideoProcessingState) -> bool {
        use VideoProcessingState::*;
        matches!(
            (self, next),
            (Unprocessed, Processing)
                | (Failed { .. }, Processing)
                | (Processing, Processed { .. })
                | (Processing, Failed { .. })
        )
    }
}

impl fmt::Display for VideoProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Slot = Arc<Mutex<VideoProcessingState>>;

fn lock_slot(slot: &Slot) -> CoreResult<MutexGuard<'_, VideoProcessingState>> {
    slot.lock()
        .map_err(|_| CoreError::Internal("registry slot lock poisoned".to_string()))
}

fn transition(
    video_id: &str,
    state: &mut VideoProcessingState,
    next: VideoProcessingState,
) -> CoreResult<()> {
    if !state.can_transition_to(&next) {
        return Err(CoreError::InvalidStateTransition {
            video_id: video_id.to_string(),
            from: state.name().to_string(),
            to: next.name().to_string(),
        });
    }
    *state = next;
    Ok(())
}

// =============================================================================
// Begin / Guard
// =============================================================================

/// Result of trying to start processing a video
pub enum BeginOutcome {
    /// The caller owns the `Processing` state until the guard resolves
    Started(ProcessingGuard),
    AlreadyProcessing,
    AlreadyProcessed { chunk_count: usize },
}

/// Exclusive right to process one video.
///
/// Dropping the guard without [`commit`](Self::commit) or
/// [`fail`](Self::fail) marks the video `Failed`.
pub struct ProcessingGuard {
    video_id: VideoId,
    slot: Slot,
    store: Arc<dyn IndexStore>,
    resolved: bool,
}

impl ProcessingGuard {
    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Persists chunks and marker together, then marks the video `Processed`.
    ///
    /// On error the video ends up `Failed` and the store is unchanged.
    pub fn commit(mut self, marker: &ProcessedMarker, chunks: &[StoredChunk]) -> CoreResult<usize> {
        if marker.video_id != self.video_id {
            return Err(CoreError::ValidationError(format!(
                "marker for {} committed under {}",
                marker.video_id, self.video_id
            )));
        }
        if let Err(e) = self.store.commit_video(marker, chunks) {
            self.mark_failed(&e.to_string());
            return Err(e);
        }

        let mut state = lock_slot(&self.slot)?;
        transition(
            &self.video_id,
            &mut state,
            VideoProcessingState::Processed {
                chunk_count: marker.chunk_count,
            },
        )?;
        drop(state);

        self.resolved = true;
        Ok(marker.chunk_count)
    }

    /// Marks the video `Failed`
    pub fn fail(mut self, reason: &str) {
        self.mark_failed(reason);
    }

    fn mark_failed(&mut self, reason: &str) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        match self.slot.lock() {
            Ok(mut state) => {
                let next = VideoProcessingState::Failed {
                    reason: reason.to_string(),
                };
                if let Err(e) = transition(&self.video_id, &mut state, next) {
                    warn!(video_id = %self.video_id, error = %e, "Could not mark video failed");
                }
            }
            Err(_) => warn!(video_id = %self.video_id, "Registry slot poisoned while failing video"),
        }
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        if !self.resolved {
            self.mark_failed("processing abandoned");
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// What startup recovery found
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Videos whose marker matches their stored chunks
    pub processed_videos: Vec<VideoId>,
    /// Markers removed because the chunk count did not match
    pub purged_markers: Vec<VideoId>,
    /// Videos whose chunks had no marker
    pub purged_orphans: Vec<VideoId>,
}

/// Tracks processing state per video on top of an [`IndexStore`]
pub struct ProcessedVideoRegistry {
    store: Arc<dyn IndexStore>,
    slots: Mutex<HashMap<VideoId, Slot>>,
}

impl ProcessedVideoRegistry {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    fn slot(&self, video_id: &str) -> CoreResult<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| CoreError::Internal("registry lock poisoned".to_string()))?;
        Ok(Arc::clone(
            slots
                .entry(video_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(VideoProcessingState::Unprocessed))),
        ))
    }

    /// Chunk count of a marker that agrees with the store, if any
    fn durable_chunk_count(&self, video_id: &str) -> CoreResult<Option<usize>> {
        let Some(marker) = self.store.get_marker(video_id)? else {
            return Ok(None);
        };
        let stored = self.store.chunk_count_for_video(video_id)?;
        Ok((stored == marker.chunk_count).then_some(stored))
    }

    /// Atomically moves the video into `Processing` unless it is already
    /// processing or processed.
    ///
    /// A marker whose chunk count disagrees with the store is treated as an
    /// interrupted write: its leftovers are purged and processing starts over.
    pub fn begin(&self, video_id: &str) -> CoreResult<BeginOutcome> {
        let slot = self.slot(video_id)?;
        let mut state = lock_slot(&slot)?;

        match &*state {
            VideoProcessingState::Processing => return Ok(BeginOutcome::AlreadyProcessing),
            VideoProcessingState::Processed { chunk_count } => {
                return Ok(BeginOutcome::AlreadyProcessed {
                    chunk_count: *chunk_count,
                })
            }
            VideoProcessingState::Unprocessed => {
                if let Some(chunk_count) = self.durable_chunk_count(video_id)? {
                    *state = VideoProcessingState::Processed { chunk_count };
                    return Ok(BeginOutcome::AlreadyProcessed { chunk_count });
                }
                self.purge_partial(video_id)?;
            }
            VideoProcessingState::Failed { .. } => {
                self.purge_partial(video_id)?;
            }
        }

        transition(video_id, &mut state, VideoProcessingState::Processing)?;
        drop(state);

        info!(video_id = %video_id, "Processing started");
        Ok(BeginOutcome::Started(ProcessingGuard {
            video_id: video_id.to_string(),
            slot,
            store: Arc::clone(&self.store),
            resolved: false,
        }))
    }

    fn purge_partial(&self, video_id: &str) -> CoreResult<()> {
        let removed = self.store.delete_video(video_id)?;
        if removed > 0 {
            warn!(video_id = %video_id, removed, "Purged partial chunks before reprocessing");
        }
        Ok(())
    }

    /// Current state, consulting the durable marker for unseen videos
    pub fn state(&self, video_id: &str) -> CoreResult<VideoProcessingState> {
        let slot = self.slot(video_id)?;
        let state = lock_slot(&slot)?;
        if *state != VideoProcessingState::Unprocessed {
            return Ok(state.clone());
        }
        Ok(match self.durable_chunk_count(video_id)? {
            Some(chunk_count) => VideoProcessingState::Processed { chunk_count },
            None => VideoProcessingState::Unprocessed,
        })
    }

    pub fn is_processed(&self, video_id: &str) -> CoreResult<bool> {
        Ok(matches!(
            self.state(video_id)?,
            VideoProcessingState::Processed { .. }
        ))
    }

    /// Deletes a video's chunks and marker and resets it to `Unprocessed`.
    ///
    /// Returns the number of chunks removed. Fails while the video is
    /// being processed.
    pub fn remove(&self, video_id: &str) -> CoreResult<usize> {
        let slot = self.slot(video_id)?;
        let mut state = lock_slot(&slot)?;
        if *state == VideoProcessingState::Processing {
            return Err(CoreError::InvalidStateTransition {
                video_id: video_id.to_string(),
                from: state.name().to_string(),
                to: VideoProcessingState::Unprocessed.name().to_string(),
            });
        }

        let removed = self.store.delete_video(video_id)?;
        *state = VideoProcessingState::Unprocessed;
        info!(video_id = %video_id, removed, "Video removed");
        Ok(removed)
    }

    /// Reconciles markers with stored chunks at startup.
    ///
    /// Markers that disagree with the store are dropped together with their
    /// chunks, and chunks with no marker are purged.
    pub fn recover(&self) -> CoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for marker in self.store.markers()? {
            let stored = self.store.chunk_count_for_video(&marker.video_id)?;
            if stored == marker.chunk_count {
                let slot = self.slot(&marker.video_id)?;
                *lock_slot(&slot)? = VideoProcessingState::Processed {
                    chunk_count: stored,
                };
                report.processed_videos.push(marker.video_id);
            } else {
                warn!(
                    video_id = %marker.video_id,
                    expected = marker.chunk_count,
                    stored,
                    "Marker does not match stored chunks; purging"
                );
                self.store.delete_video(&marker.video_id)?;
                report.purged_markers.push(marker.video_id);
            }
        }

        for video_id in self.store.videos_with_chunks()? {
            if !self.store.has_marker(&video_id)? {
                warn!(video_id = %video_id, "Purging chunks without a processed marker");
                self.store.delete_video(&video_id)?;
                report.purged_orphans.push(video_id);
            }
        }

        info!(
            processed = report.processed_videos.len(),
            purged_markers = report.purged_markers.len(),
            purged_orphans = report.purged_orphans.len(),
            "Registry recovered"
        );
        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================
