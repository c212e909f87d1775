//! Search System Module
//!
//! Answers natural-language queries against the vector index with a ranked,
//! timestamped result list.

mod ranker;

pub use ranker::*;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::core::embedding::{EmbedOptions, EmbeddingClient};
use crate::core::index::{ScopeFilter, VectorIndex};
use crate::core::{CoreError, CoreResult, TimeRange, VideoId};

/// Results returned when a query does not ask for a count
pub const DEFAULT_RESULT_LIMIT: usize = 5;

/// Upper bound on results per query
pub const MAX_RESULT_LIMIT: usize = 50;

// =============================================================================
// Search Query
// =============================================================================

/// Search query parameters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Text to search for
    pub text: String,
    /// Videos to search; empty means every indexed video
    #[serde(default)]
    pub video_scope: Vec<VideoId>,
    /// Maximum number of results
    #[serde(default)]
    pub limit: Option<usize>,
    /// Only chunks overlapping this window
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl SearchQuery {
    /// Creates a query over every indexed video
    pub fn text(query: &str) -> Self {
        Self {
            text: query.to_string(),
            ..Default::default()
        }
    }

    /// Restricts the query to the given videos
    pub fn with_scope(mut self, videos: Vec<VideoId>) -> Self {
        self.video_scope = videos;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Effective result count, clamped to `[1, MAX_RESULT_LIMIT]`
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_RESULT_LIMIT)
            .clamp(1, MAX_RESULT_LIMIT)
    }

    pub fn scope_filter(&self) -> ScopeFilter {
        ScopeFilter::from_videos(&self.video_scope)
    }
}

/// Ranked results plus how long the query took
#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub latency: Duration,
}

// =============================================================================
// Query Service
// =============================================================================

/// Embeds the query, pulls a candidate pool from the index and ranks it
pub struct QueryService {
    embedder: Arc<EmbeddingClient>,
    index: Arc<VectorIndex>,
    ranker: HybridRanker,
}

impl QueryService {
    pub fn new(embedder: Arc<EmbeddingClient>, index: Arc<VectorIndex>, ranker: HybridRanker) -> Self {
        Self {
            embedder,
            index,
            ranker,
        }
    }

    pub fn ranker(&self) -> &HybridRanker {
        &self.ranker
    }

    /// Runs one query.
    ///
    /// Returns an empty list when nothing clears the ranker's minimum score.
    pub async fn search(&self, query: &SearchQuery, options: &EmbedOptions) -> CoreResult<SearchOutcome> {
        let started = Instant::now();

        let text = query.text.trim();
        if text.is_empty() {
            return Err(CoreError::ValidationError(
                "Query text must not be empty".to_string(),
            ));
        }

        let limit = query.effective_limit();
        let vector = self.embedder.embed_query(text, options).await?;

        let hits = self.index.search_within(
            &vector,
            self.ranker.candidate_pool(limit),
            &query.scope_filter(),
            query.time_range.as_ref(),
        )?;
        let candidates: Vec<RankCandidate> = hits
            .into_iter()
            .map(|hit| RankCandidate {
                chunk_id: hit.entry.chunk_id.clone(),
                video_id: hit.entry.video_id.clone(),
                start_sec: hit.entry.start_sec,
                end_sec: hit.entry.end_sec,
                text: hit.entry.text.clone(),
                distance: hit.distance,
            })
            .collect();

        let durations = self.index.video_durations()?;
        let results = self.ranker.rank(text, &candidates, &durations, limit);
        let latency = started.elapsed();

        debug!(
            query = text,
            candidates = candidates.len(),
            results = results.len(),
            latency_ms = latency.as_millis() as u64,
            "Query ranked"
        );

        Ok(SearchOutcome { results, latency })
    }
}

/// Truncates text to at most `max_chars` characters, marking the cut with "..."
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

// =============================================================================
// Tests
// =============================================================================
