//! Request Handlers
//!
//! Transport-agnostic handlers over [`RetrievalEngine`]. Every handler
//! answers with an [`ApiResponse`]; engine errors become error envelopes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::ingest::{IngestJob, TriggerStatus};
use crate::core::search::SearchQuery;
use crate::core::{CoreResult, TimeRange, VideoId, VideoRef};
use crate::{EngineStats, RetrievalEngine};

use super::dto::{
    ApiResponse, IngestRequest, IngestResponse, QueryRequest, QueryResponse, QueryResultItem,
};

/// Handler facade shared by transports
#[derive(Clone)]
pub struct RetrievalApi {
    engine: Arc<RetrievalEngine>,
}

impl RetrievalApi {
    pub fn new(engine: Arc<RetrievalEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<RetrievalEngine> {
        &self.engine
    }

    /// Answers a natural-language query
    pub async fn query(&self, request: QueryRequest, cancel: &CancellationToken) -> ApiResponse<QueryResponse> {
        let scope = match parse_scope(&request.video_scope) {
            Ok(scope) => scope,
            Err(e) => return ApiResponse::error(e.to_ipc_error()),
        };

        let mut query = SearchQuery::text(&request.query_text).with_scope(scope);
        if let Some(k) = request.k {
            query = query.with_limit(k);
        }
        if let Some(range) = request.timestamp_range {
            match TimeRange::new(range.start_sec, range.end_sec) {
                Ok(range) => query = query.with_time_range(range),
                Err(e) => return ApiResponse::error(e.to_ipc_error()),
            }
        }

        match self.engine.query(&query, cancel).await {
            Ok(outcome) => {
                debug!(results = outcome.results.len(), "Query answered");
                ApiResponse::ok(QueryResponse {
                    results: outcome.results.iter().map(QueryResultItem::from).collect(),
                    latency_ms: outcome.latency.as_millis() as u64,
                })
            }
            Err(e) => {
                warn!("Query failed: {}", e);
                ApiResponse::error(e.to_ipc_error())
            }
        }
    }

    /// Starts background ingestion. A failed trigger still carries its
    /// details in `data`.
    pub fn ingest(&self, request: IngestRequest) -> ApiResponse<IngestResponse> {
        let result = self.engine.trigger_ingest(&request.video_url);
        if result.status == TriggerStatus::Failed {
            let message = result
                .message
                .clone()
                .unwrap_or_else(|| "Ingestion failed".to_string());
            return ApiResponse {
                data: Some(IngestResponse::from(result)),
                ..ApiResponse::error(message)
            };
        }
        ApiResponse::ok(IngestResponse::from(result))
    }

    pub fn job_status(&self, job_id: &str) -> ApiResponse<IngestJob> {
        match self.engine.job(job_id) {
            Some(job) => ApiResponse::ok(job),
            None => ApiResponse::error(format!("Job not found: {}", job_id)),
        }
    }

    pub fn list_jobs(&self) -> ApiResponse<Vec<IngestJob>> {
        ApiResponse::ok(self.engine.jobs())
    }

    pub fn cancel_job(&self, job_id: &str) -> ApiResponse<bool> {
        if self.engine.cancel_job(job_id) {
            ApiResponse::ok(true)
        } else {
            ApiResponse::error(format!("Job not found or already finished: {}", job_id))
        }
    }

    /// Removes a video from the index; returns the number of chunks deleted
    pub async fn remove_video(&self, video: &str) -> ApiResponse<usize> {
        let video_id = match VideoRef::parse(video) {
            Ok(video) => video.video_id,
            Err(e) => return ApiResponse::error(e.to_ipc_error()),
        };
        match self.engine.remove_video(&video_id).await {
            Ok(removed) => ApiResponse::ok(removed),
            Err(e) => ApiResponse::error(e.to_ipc_error()),
        }
    }

    pub fn stats(&self) -> ApiResponse<EngineStats> {
        match self.engine.stats() {
            Ok(stats) => ApiResponse::ok(stats),
            Err(e) => ApiResponse::error(e.to_ipc_error()),
        }
    }
}

fn parse_scope(entries: &[String]) -> CoreResult<Vec<VideoId>> {
    entries
        .iter()
        .map(|entry| VideoRef::parse(entry).map(|video| video.video_id))
        .collect()
}
