//! ReelIndex Core Library
//!
//! Transcript retrieval engine: turns video transcripts into a
//! timestamp-addressable semantic index and answers natural-language queries
//! with a ranked, timestamped result list.
//!
//! [`RetrievalEngine`] wires settings, storage, the vector index, the
//! processed-video registry, embedding, search and background ingestion.

pub mod core;
pub mod ipc;
pub mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{
    chunking::ChunkBuilder,
    embedding::{create_embedding_provider, EmbedOptions, EmbeddingClient, EmbeddingProvider, QuotaGate},
    fs::ensure_data_dir,
    index::{IndexStats, VectorIndex},
    ingest::{
        FallbackSource, IngestJob, IngestOutcome, IngestStatus, IngestWorkerPool, IngestionService,
        NoFallback, ProcessedVideoRegistry, RecoveryReport, TriggerResult, WorkerPoolConfig,
        DEFAULT_JOB_RETENTION,
    },
    search::{HybridRanker, QueryService, SearchOutcome, SearchQuery},
    settings::{RetrievalSettings, SettingsManager, StorageBackend},
    store::{IndexStore, MemoryIndexStore, SqliteIndexStore},
    transcript::{JsonDirTranscriptProvider, SegmentStore, TranscriptProvider},
    CoreError, CoreResult, VideoRef,
};

/// Application directory name under the platform data directory
pub const APP_DIR_NAME: &str = "reelindex";

/// Default data directory (`{platform data dir}/reelindex`)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

// =============================================================================
// Engine Statistics
// =============================================================================

/// Snapshot of engine state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub index: IndexStats,
    pub stored_chunks: usize,
    pub processed_videos: usize,
    /// Remaining quota window, if one is open
    pub quota_remaining_ms: Option<u64>,
    pub active_jobs: usize,
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Assembles a [`RetrievalEngine`] from settings plus optional collaborators
pub struct EngineBuilder {
    settings: RetrievalSettings,
    store: Option<Arc<dyn IndexStore>>,
    transcripts: Option<Arc<dyn TranscriptProvider>>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    quota: Option<Arc<QuotaGate>>,
    fallback: Arc<dyn FallbackSource>,
}

impl EngineBuilder {
    pub fn new(settings: RetrievalSettings) -> Self {
        Self {
            settings,
            store: None,
            transcripts: None,
            embeddings: None,
            quota: None,
            fallback: Arc::new(NoFallback),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transcripts(mut self, provider: Arc<dyn TranscriptProvider>) -> Self {
        self.transcripts = Some(provider);
        self
    }

    /// Uses `provider` instead of the one named in settings
    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    /// Shares an existing quota gate
    pub fn with_quota_gate(mut self, quota: Arc<QuotaGate>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackSource>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Builds the engine, reconciling the store and loading the index.
    pub fn build(self) -> CoreResult<RetrievalEngine> {
        let mut settings = self.settings;
        settings.normalize();

        let store: Arc<dyn IndexStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryIndexStore::new()),
        };
        let transcripts = self.transcripts.ok_or_else(|| {
            CoreError::ValidationError("A transcript provider is required".to_string())
        })?;
        let provider = match self.embeddings {
            Some(provider) => provider,
            None => create_embedding_provider(&settings.embedding.provider)?,
        };
        let quota = self
            .quota
            .unwrap_or_else(|| Arc::new(QuotaGate::new(settings.quota.clone())));

        let dimension = provider.dimension();
        let embedder = Arc::new(
            EmbeddingClient::new(provider, quota, settings.embedding.backoff.clone())
                .with_batch_limit(settings.embedding.batch_limit),
        );
        let index = Arc::new(VectorIndex::new(dimension, settings.index.metric));
        let registry = Arc::new(ProcessedVideoRegistry::new(Arc::clone(&store)));

        let recovery = registry.recover()?;
        load_index(&registry, &index, &embedder, &recovery)?;

        let segments = Arc::new(SegmentStore::new(
            transcripts,
            settings.ingestion.preferred_languages.clone(),
        ));
        let ingestion = Arc::new(
            IngestionService::new(
                Arc::clone(&segments),
                ChunkBuilder::new(settings.chunking.clone())?,
                Arc::clone(&embedder),
                Arc::clone(&index),
                Arc::clone(&registry),
            )
            .with_deadline(settings.ingestion.timeout())
            .with_fallback(self.fallback),
        );
        let queries = QueryService::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            HybridRanker::from_config(&settings.ranking, settings.index.metric),
        );
        let workers = IngestWorkerPool::new(
            Arc::clone(&ingestion),
            WorkerPoolConfig {
                num_workers: settings.ingestion.workers,
                max_queue_size: settings.ingestion.max_queue_size,
                job_retention: DEFAULT_JOB_RETENTION,
            },
        );

        info!(
            store = store.name(),
            model = embedder.model(),
            dimension,
            indexed_chunks = index.len()?,
            "Retrieval engine ready"
        );

        Ok(RetrievalEngine {
            settings,
            store,
            index,
            registry,
            embedder,
            segments,
            ingestion,
            queries,
            workers,
        })
    }
}

/// Loads every recovered video into the index.
///
/// Videos embedded with another model or dimension are removed so they are
/// re-ingested on demand.
fn load_index(
    registry: &ProcessedVideoRegistry,
    index: &VectorIndex,
    embedder: &EmbeddingClient,
    recovery: &RecoveryReport,
) -> CoreResult<()> {
    let store = registry.store();
    for video_id in &recovery.processed_videos {
        let stale_model = store
            .get_marker(video_id)?
            .is_some_and(|marker| marker.embedding_model != embedder.model());
        let chunks = store.chunks_for_video(video_id)?;
        let stale_dimension = chunks
            .iter()
            .any(|c| c.vector.len() != embedder.dimension());

        if stale_model || stale_dimension {
            warn!(video_id = %video_id, "Stored embeddings do not match the current model; dropping");
            registry.remove(video_id)?;
            continue;
        }

        index.add_batch(chunks.iter().map(|c| c.to_index_entry()).collect())?;
    }
    Ok(())
}

// =============================================================================
// Retrieval Engine
// =============================================================================

/// The retrieval core
pub struct RetrievalEngine {
    settings: RetrievalSettings,
    store: Arc<dyn IndexStore>,
    index: Arc<VectorIndex>,
    registry: Arc<ProcessedVideoRegistry>,
    embedder: Arc<EmbeddingClient>,
    segments: Arc<SegmentStore>,
    ingestion: Arc<IngestionService>,
    queries: QueryService,
    workers: IngestWorkerPool,
}

impl RetrievalEngine {
    pub fn builder(settings: RetrievalSettings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    /// Opens an engine over `data_dir`.
    ///
    /// Reads `settings.json`, opens the configured store and serves
    /// transcripts from the configured directory (default
    /// `{data_dir}/transcripts`).
    pub fn open(data_dir: &Path) -> CoreResult<Self> {
        let data_dir = ensure_data_dir(data_dir)?;
        let settings = SettingsManager::new(data_dir.clone()).load();

        let store: Arc<dyn IndexStore> = match settings.storage.backend {
            StorageBackend::Sqlite => Arc::new(SqliteIndexStore::open(
                settings.storage.database_path(&data_dir),
            )?),
            StorageBackend::Memory => Arc::new(MemoryIndexStore::new()),
        };
        let transcripts_dir = settings
            .ingestion
            .transcripts_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("transcripts"));

        EngineBuilder::new(settings)
            .with_store(store)
            .with_transcripts(Arc::new(JsonDirTranscriptProvider::new(transcripts_dir)))
            .build()
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<ProcessedVideoRegistry> {
        &self.registry
    }

    pub fn embedder(&self) -> &Arc<EmbeddingClient> {
        &self.embedder
    }

    /// Runs a query. Unprocessed videos in the scope are ingested first
    /// when auto-ingest is enabled.
    ///
    /// A scoped video that was replaced by a fallback alternate is searched
    /// under the alternate's id.
    pub async fn query(&self, query: &SearchQuery, cancel: &CancellationToken) -> CoreResult<SearchOutcome> {
        let mut scope = query.video_scope.clone();
        if self.settings.ingestion.auto_ingest_on_query {
            for slot in scope.iter_mut() {
                if self.registry.is_processed(slot)? {
                    continue;
                }
                let outcome = self.ingestion.ingest(slot, cancel).await?;
                if outcome.status == IngestStatus::AlreadyProcessing {
                    info!(video_id = %slot, "Video is being ingested elsewhere; searching current index");
                }
                if outcome.fallback_from.is_some() {
                    info!(video_id = %slot, alternate = %outcome.video_id, "Searching fallback alternate instead");
                    *slot = outcome.video_id;
                }
            }
        }

        let options = EmbedOptions::blocking(cancel.clone());
        if scope == query.video_scope {
            return self.queries.search(query, &options).await;
        }
        let rescoped = query.clone().with_scope(scope);
        self.queries.search(&rescoped, &options).await
    }

    /// Ingests a video in the caller's task
    pub async fn ingest(&self, video_url: &str, cancel: &CancellationToken) -> CoreResult<IngestOutcome> {
        let video = VideoRef::parse(video_url)?;
        self.ingestion.ingest(&video.video_id, cancel).await
    }

    /// Starts background ingestion
    pub fn trigger_ingest(&self, video_url: &str) -> TriggerResult {
        self.workers.trigger(video_url)
    }

    pub fn job(&self, job_id: &str) -> Option<IngestJob> {
        self.workers.get_job(job_id)
    }

    pub fn jobs(&self) -> Vec<IngestJob> {
        self.workers.list_jobs()
    }

    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.workers.cancel(job_id)
    }

    pub async fn wait_for_job(&self, job_id: &str) -> CoreResult<IngestJob> {
        self.workers.wait(job_id).await
    }

    /// Deletes a video's chunks, marker and index entries so it can be
    /// ingested again. Returns the number of stored chunks removed.
    pub async fn remove_video(&self, video_id: &str) -> CoreResult<usize> {
        let removed = self.registry.remove(video_id)?;
        self.index.remove_video(video_id)?;
        self.segments.evict(video_id).await;
        Ok(removed)
    }

    pub fn stats(&self) -> CoreResult<EngineStats> {
        let processed_videos = self.store.markers()?.len();
        Ok(EngineStats {
            index: self.index.stats()?,
            stored_chunks: self.store.chunk_count()?,
            processed_videos,
            quota_remaining_ms: self
                .embedder
                .quota()
                .remaining()
                .map(|d| d.as_millis() as u64),
            active_jobs: self
                .workers
                .list_jobs()
                .iter()
                .filter(|job| !job.status.is_terminal())
                .count(),
        })
    }

    /// Cancels background jobs
    pub fn shutdown(&self) {
        self.workers.shutdown();
    }
}

// =============================================================================
// Tests
// =============================================================================
