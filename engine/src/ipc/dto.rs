//! IPC DTOs
//!
//! Wire types for the query and ingestion endpoints. All fields are
//! camelCase JSON; enums serialize to stable lowercase strings.

use serde::{Deserialize, Serialize};

use crate::core::ingest::{TriggerResult, TriggerStatus};
use crate::core::search::{truncate_text, SearchResult};
use crate::core::{JobId, VideoId};

/// Longest `content` string returned per result
pub const MAX_CONTENT_CHARS: usize = 500;

// =============================================================================
// Envelope
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Success,
    Error,
}

/// Response envelope. Failures are values, never panics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub status: ApiStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: ApiStatus::Success,
            message: None,
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ApiStatus::Error,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ApiStatus::Success
    }
}

// =============================================================================
// Query
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_text: String,
    /// Video URLs or ids; empty searches every indexed video
    #[serde(default)]
    pub video_scope: Vec<String>,
    #[serde(default)]
    pub k: Option<usize>,
    /// Only return chunks overlapping `[startSec, endSec)`
    #[serde(default)]
    pub timestamp_range: Option<TimestampRange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampRange {
    pub start_sec: f64,
    pub end_sec: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultItem {
    pub timestamp_string: String,
    pub start_sec: f64,
    pub end_sec: f64,
    pub content: String,
    pub combined_score: f64,
    pub video_id: VideoId,
    pub chunk_id: String,
}

impl From<&SearchResult> for QueryResultItem {
    fn from(result: &SearchResult) -> Self {
        Self {
            timestamp_string: result.timestamp.clone(),
            start_sec: result.start_sec,
            end_sec: result.end_sec,
            content: truncate_text(&result.text, MAX_CONTENT_CHARS),
            combined_score: result.combined_score,
            video_id: result.video_id.clone(),
            chunk_id: result.chunk_id.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub results: Vec<QueryResultItem>,
    pub latency_ms: u64,
}

// =============================================================================
// Ingestion
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub video_url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// `already_processed | processing_started | processing | failed`
    pub status: TriggerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<VideoId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<TriggerResult> for IngestResponse {
    fn from(result: TriggerResult) -> Self {
        Self {
            status: result.status,
            video_id: result.video_id,
            job_id: result.job_id,
            chunk_count: result.chunk_count,
            message: result.message,
        }
    }
}
