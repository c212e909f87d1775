//! Ingestion Orchestration
//!
//! segments -> chunks -> embeddings -> index + store, under a per-video
//! deadline. A video is marked processed only after its chunks and marker
//! are committed together; any failure rolls back what was written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::registry::{BeginOutcome, ProcessedVideoRegistry, ProcessingGuard};
use crate::core::chunking::ChunkBuilder;
use crate::core::embedding::{EmbedOptions, EmbedPurpose, EmbeddingClient};
use crate::core::index::VectorIndex;
use crate::core::store::{ProcessedMarker, StoredChunk};
use crate::core::transcript::SegmentStore;
use crate::core::{CoreError, CoreResult, VideoId};

/// Default per-video ingestion deadline
pub const DEFAULT_INGEST_DEADLINE: Duration = Duration::from_secs(600);

// =============================================================================
// Fallback Source
// =============================================================================

/// Supplies an alternate video when ingestion of the requested one fails
#[async_trait]
pub trait FallbackSource: Send + Sync {
    async fn alternate_for(&self, video_id: &str, failure: &CoreError) -> Option<VideoId>;
}

/// Never offers an alternate
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFallback;

#[async_trait]
impl FallbackSource for NoFallback {
    async fn alternate_for(&self, _video_id: &str, _failure: &CoreError) -> Option<VideoId> {
        None
    }
}

/// Fixed video id to alternate id mapping
#[derive(Clone, Debug, Default)]
pub struct StaticFallback {
    alternates: HashMap<VideoId, VideoId>,
}

impl StaticFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alternate(mut self, video_id: &str, alternate: &str) -> Self {
        self.alternates
            .insert(video_id.to_string(), alternate.to_string());
        self
    }
}

#[async_trait]
impl FallbackSource for StaticFallback {
    async fn alternate_for(&self, video_id: &str, _failure: &CoreError) -> Option<VideoId> {
        self.alternates.get(video_id).cloned()
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// How an ingestion request was satisfied
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// This call indexed the video
    Processed,
    /// A previous run already indexed it
    AlreadyProcessed,
    /// Another run holds the video
    AlreadyProcessing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    /// Video that was actually indexed
    pub video_id: VideoId,
    pub status: IngestStatus,
    pub chunk_count: usize,
    /// Requested video, when an alternate was indexed in its place
    pub fallback_from: Option<VideoId>,
}

impl IngestOutcome {
    fn new(video_id: &str, status: IngestStatus, chunk_count: usize) -> Self {
        Self {
            video_id: video_id.to_string(),
            status,
            chunk_count,
            fallback_from: None,
        }
    }
}

// =============================================================================
// Ingestion Service
// =============================================================================

/// Drives one video through the ingestion pipeline
pub struct IngestionService {
    segments: Arc<SegmentStore>,
    chunker: ChunkBuilder,
    embedder: Arc<EmbeddingClient>,
    index: Arc<VectorIndex>,
    registry: Arc<ProcessedVideoRegistry>,
    fallback: Arc<dyn FallbackSource>,
    deadline: Duration,
}

impl IngestionService {
    pub fn new(
        segments: Arc<SegmentStore>,
        chunker: ChunkBuilder,
        embedder: Arc<EmbeddingClient>,
        index: Arc<VectorIndex>,
        registry: Arc<ProcessedVideoRegistry>,
    ) -> Self {
        Self {
            segments,
            chunker,
            embedder,
            index,
            registry,
            fallback: Arc::new(NoFallback),
            deadline: DEFAULT_INGEST_DEADLINE,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackSource>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn registry(&self) -> &Arc<ProcessedVideoRegistry> {
        &self.registry
    }

    /// Ingests `video_id`, trying one alternate from the fallback source if
    /// the requested video fails.
    ///
    /// Cancellation and expired deadlines surface as `Cancelled` and never
    /// trigger the fallback.
    pub async fn ingest(&self, video_id: &str, cancel: &CancellationToken) -> CoreResult<IngestOutcome> {
        let err = match self.ingest_video(video_id, cancel).await {
            Ok(outcome) => return Ok(outcome),
            Err(err @ CoreError::Cancelled(_)) => return Err(err),
            Err(err) => err,
        };

        let alternate = self
            .fallback
            .alternate_for(video_id, &err)
            .await
            .filter(|alt| alt != video_id);
        let Some(alternate) = alternate else {
            return Err(err.into_ingestion_failure(video_id));
        };

        warn!(
            video_id = %video_id,
            alternate = %alternate,
            error = %err,
            "Ingestion failed; trying alternate source"
        );
        match self.ingest_video(&alternate, cancel).await {
            Ok(mut outcome) => {
                outcome.fallback_from = Some(video_id.to_string());
                Ok(outcome)
            }
            Err(alt_err) => Err(alt_err.into_ingestion_failure(&alternate)),
        }
    }

    async fn ingest_video(&self, video_id: &str, cancel: &CancellationToken) -> CoreResult<IngestOutcome> {
        let guard = match self.registry.begin(video_id)? {
            BeginOutcome::AlreadyProcessed { chunk_count } => {
                return Ok(IngestOutcome::new(video_id, IngestStatus::AlreadyProcessed, chunk_count))
            }
            BeginOutcome::AlreadyProcessing => {
                return Ok(IngestOutcome::new(video_id, IngestStatus::AlreadyProcessing, 0))
            }
            BeginOutcome::Started(guard) => guard,
        };

        let run = tokio::time::timeout(self.deadline, self.build_chunks(video_id, cancel));
        let built = tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled(format!("ingestion of {} cancelled", video_id))),
            result = run => match result {
                Ok(result) => result,
                Err(_) => Err(CoreError::Cancelled(format!(
                    "ingestion of {} exceeded its {}s deadline",
                    video_id,
                    self.deadline.as_secs()
                ))),
            },
        };
        // Chunks carry the text from here on
        self.segments.evict(video_id).await;

        match built {
            Ok(chunks) => self.publish(guard, chunks),
            Err(err) => {
                warn!(video_id = %video_id, error = %err, "Ingestion failed");
                guard.fail(&err.to_string());
                Err(err)
            }
        }
    }

    /// Fetches, chunks and embeds one video. Writes nothing.
    async fn build_chunks(&self, video_id: &str, cancel: &CancellationToken) -> CoreResult<Vec<StoredChunk>> {
        let transcript = self.segments.segments(video_id).await?;
        let chunks = self.chunker.build(video_id, &transcript.segments)?;
        if chunks.is_empty() {
            info!(video_id = %video_id, "Transcript is empty; nothing to embed");
            return Ok(Vec::new());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts, EmbedPurpose::Document, &EmbedOptions::blocking(cancel.clone()))
            .await?;

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| StoredChunk::new(chunk, vector))
            .collect())
    }

    /// Adds chunks to the index and commits them with the marker.
    /// On commit failure the index entries are removed again.
    fn publish(&self, guard: ProcessingGuard, chunks: Vec<StoredChunk>) -> CoreResult<IngestOutcome> {
        let video_id = guard.video_id().to_string();
        let entries = chunks.iter().map(StoredChunk::to_index_entry).collect();
        if let Err(err) = self.index.add_batch(entries) {
            guard.fail(&err.to_string());
            return Err(err);
        }

        let marker = ProcessedMarker::new(&video_id, chunks.len(), self.embedder.model());
        match guard.commit(&marker, &chunks) {
            Ok(chunk_count) => {
                info!(video_id = %video_id, chunk_count, "Video processed");
                Ok(IngestOutcome::new(&video_id, IngestStatus::Processed, chunk_count))
            }
            Err(err) => {
                if let Err(rollback) = self.index.remove_video(&video_id) {
                    warn!(video_id = %video_id, error = %rollback, "Index rollback failed");
                }
                Err(err)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::chunking::ChunkConfig;
    use crate::core::embedding::{BackoffPolicy, MockEmbeddingProvider, QuotaConfig, QuotaGate};
    use crate::core::index::DistanceMetric;
    use crate::core::store::{IndexStore, MemoryIndexStore};
    use crate::core::transcript::MockTranscriptProvider;
    use crate::core::ingest::VideoProcessingState;

    pub(crate) const DIM: usize = 32;

    pub(crate) struct Harness {
        pub service: Arc<IngestionService>,
        pub provider: Arc<MockEmbeddingProvider>,
        pub index: Arc<VectorIndex>,
        pub store: Arc<MemoryIndexStore>,
    }

    pub(crate) fn lecture_transcripts() -> MockTranscriptProvider {
        MockTranscriptProvider::new()
            .with_transcript(
                "lecture",
                "en",
                &[
                    (0.0, 12.0, "intro"),
                    (12.0, 24.0, "gradient descent explanation"),
                    (24.0, 36.0, "outro"),
                ],
            )
            .with_transcript("silent", "en", &[])
    }

    pub(crate) fn harness(transcripts: MockTranscriptProvider, provider: MockEmbeddingProvider) -> Harness {
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryIndexStore::new());
        let index = Arc::new(VectorIndex::new(DIM, DistanceMetric::Cosine));
        let embedder = EmbeddingClient::new(
            provider.clone(),
            Arc::new(QuotaGate::new(QuotaConfig::default())),
            BackoffPolicy::default(),
        );
        let service = IngestionService::new(
            Arc::new(SegmentStore::new(Arc::new(transcripts), vec!["en".to_string()])),
            ChunkBuilder::new(ChunkConfig::default()).unwrap(),
            Arc::new(embedder),
            index.clone(),
            Arc::new(ProcessedVideoRegistry::new(store.clone())),
        );
        Harness {
            service: Arc::new(service),
            provider,
            index,
            store,
        }
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ingest_indexes_and_marks_processed() {
        let h = harness(lecture_transcripts(), MockEmbeddingProvider::new(DIM));
        let cancel = CancellationToken::new();

        let outcome = h.service.ingest("lecture", &cancel).await.unwrap();

        assert_eq!(outcome.status, IngestStatus::Processed);
        assert_eq!(outcome.chunk_count, 2);
        assert_eq!(h.index.chunk_count_for_video("lecture").unwrap(), 2);
        assert_eq!(h.store.chunk_count_for_video("lecture").unwrap(), 2);
        assert_eq!(h.store.get_marker("lecture").unwrap().unwrap().chunk_count, 2);

        // Chunk order is index insertion order
        let ids: Vec<String> = h
            .store
            .chunks_for_video("lecture")
            .unwrap()
            .into_iter()
            .map(|c| c.chunk.chunk_id)
            .collect();
        assert_eq!(ids, vec!["lecture#00000", "lecture#00001"]);
    }

    #[tokio::test]
    async fn test_transcript_cache_released_after_ingest() {
        let h = harness(lecture_transcripts(), MockEmbeddingProvider::new(DIM));
        let cancel = CancellationToken::new();

        h.service.ingest("lecture", &cancel).await.unwrap();
        h.service.ingest("silent", &cancel).await.unwrap();
        assert_eq!(h.service.segments.cached_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_cache_released_after_failed_ingest() {
        let transient = crate::core::embedding::ProviderError::Transient("503".to_string());
        let h = harness(
            lecture_transcripts(),
            MockEmbeddingProvider::new(DIM).with_failure_for("outro", transient),
        );

        h.service
            .ingest("lecture", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(h.service.segments.cached_count().await, 0);
    }

    #[tokio::test]
    async fn test_reingest_is_noop() {
        let h = harness(lecture_transcripts(), MockEmbeddingProvider::new(DIM));
        let cancel = CancellationToken::new();

        h.service.ingest("lecture", &cancel).await.unwrap();
        let calls = h.provider.call_count();

        let again = h.service.ingest("lecture", &cancel).await.unwrap();

        assert_eq!(again.status, IngestStatus::AlreadyProcessed);
        assert_eq!(again.chunk_count, 2);
        assert_eq!(h.provider.call_count(), calls);
        assert_eq!(h.index.len().unwrap(), 2);
        assert_eq!(h.store.all_chunks().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_transcript_is_processed_with_zero_chunks() {
        let h = harness(lecture_transcripts(), MockEmbeddingProvider::new(DIM));

        let outcome = h
            .service
            .ingest("silent", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, IngestStatus::Processed);
        assert_eq!(outcome.chunk_count, 0);
        assert_eq!(h.provider.call_count(), 0);
        assert!(h.service.registry().is_processed("silent").unwrap());
    }

    #[tokio::test]
    async fn test_missing_transcript_fails_only_that_video() {
        let h = harness(lecture_transcripts(), MockEmbeddingProvider::new(DIM));
        let cancel = CancellationToken::new();

        let err = h.service.ingest("missing", &cancel).await.unwrap_err();
        assert!(matches!(err, CoreError::TranscriptUnavailable { .. }));
        assert!(matches!(
            h.service.registry().state("missing").unwrap(),
            VideoProcessingState::Failed { .. }
        ));

        let ok = h.service.ingest("lecture", &cancel).await.unwrap();
        assert_eq!(ok.status, IngestStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_as_ingestion_failed() {
        let transient = crate::core::embedding::ProviderError::Transient("503".to_string());
        let h = harness(
            lecture_transcripts(),
            MockEmbeddingProvider::new(DIM).with_failure_for("outro", transient),
        );

        let err = h
            .service
            .ingest("lecture", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::IngestionFailed { .. }));
        assert!(h.index.is_empty().unwrap());
        assert!(h.store.all_chunks().unwrap().is_empty());
        assert!(!h.store.has_marker("lecture").unwrap());
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_index() {
        let h = harness(lecture_transcripts(), MockEmbeddingProvider::new(DIM));
        h.store.set_fail_commits(true);

        let err = h
            .service
            .ingest("lecture", &CancellationToken::new())
            .await
            .unwrap_err();

        // Embedding ran and the commit was reached after the index write
        assert!(matches!(err, CoreError::IndexUnavailable(_)));
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(h.store.commit_attempts(), 1);
        assert!(h.index.is_empty().unwrap());
        assert!(!h.store.has_marker("lecture").unwrap());
        assert!(matches!(
            h.service.registry().state("lecture").unwrap(),
            VideoProcessingState::Failed { .. }
        ));

        // Retry after the store recovers
        h.store.set_fail_commits(false);
        let outcome = h
            .service
            .ingest("lecture", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, IngestStatus::Processed);
        assert_eq!(h.index.len().unwrap(), 2);
    }

    // -------------------------------------------------------------------------
    // Concurrency, deadlines, cancellation
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ingest_runs_once() {
        let h = harness(
            lecture_transcripts(),
            MockEmbeddingProvider::new(DIM).with_latency(Duration::from_millis(200)),
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&h.service);
                tokio::spawn(async move { service.ingest("lecture", &CancellationToken::new()).await })
            })
            .collect();

        let mut processed = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            if outcome.status == IngestStatus::Processed {
                processed += 1;
            }
        }

        assert_eq!(processed, 1);
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(h.index.len().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_cancelled_and_rolls_back() {
        let h = harness(
            lecture_transcripts(),
            MockEmbeddingProvider::new(DIM).with_latency(Duration::from_secs(30)),
        );
        let service = IngestionService::new(
            Arc::clone(&h.service.segments),
            ChunkBuilder::new(ChunkConfig::default()).unwrap(),
            Arc::clone(&h.service.embedder),
            Arc::clone(&h.index),
            Arc::clone(h.service.registry()),
        )
        .with_deadline(Duration::from_secs(5));

        let err = service
            .ingest("lecture", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Cancelled(_)));
        assert!(h.index.is_empty().unwrap());
        assert!(!h.store.has_marker("lecture").unwrap());
        assert!(matches!(
            service.registry().state("lecture").unwrap(),
            VideoProcessingState::Failed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_ingestion() {
        let h = harness(
            lecture_transcripts(),
            MockEmbeddingProvider::new(DIM).with_latency(Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();

        let service = Arc::clone(&h.service);
        let token = cancel.clone();
        let task = tokio::spawn(async move { service.ingest("lecture", &token).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::Cancelled(_)));
        assert!(h.index.is_empty().unwrap());
    }

    // -------------------------------------------------------------------------
    // Fallback
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_fallback_indexes_alternate() {
        let h = harness(lecture_transcripts(), MockEmbeddingProvider::new(DIM));
        let service = IngestionService::new(
            Arc::clone(&h.service.segments),
            ChunkBuilder::new(ChunkConfig::default()).unwrap(),
            Arc::clone(&h.service.embedder),
            Arc::clone(&h.index),
            Arc::clone(h.service.registry()),
        )
        .with_fallback(Arc::new(StaticFallback::new().with_alternate("missing", "lecture")));

        let outcome = service
            .ingest("missing", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.video_id, "lecture");
        assert_eq!(outcome.fallback_from.as_deref(), Some("missing"));
        assert_eq!(outcome.status, IngestStatus::Processed);
        assert!(matches!(
            service.registry().state("missing").unwrap(),
            VideoProcessingState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_alternate_reports_alternate() {
        let h = harness(lecture_transcripts(), MockEmbeddingProvider::new(DIM));
        let service = IngestionService::new(
            Arc::clone(&h.service.segments),
            ChunkBuilder::new(ChunkConfig::default()).unwrap(),
            Arc::clone(&h.service.embedder),
            Arc::clone(&h.index),
            Arc::clone(h.service.registry()),
        )
        .with_fallback(Arc::new(StaticFallback::new().with_alternate("missing", "gone")));

        let err = service
            .ingest("missing", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            CoreError::TranscriptUnavailable { video_id, .. } => assert_eq!(video_id, "gone"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
