//! Google Gemini Embedding Provider
//!
//! Calls the `embedContent` endpoint. Chunks are embedded with the
//! `RETRIEVAL_DOCUMENT` task type and queries with `RETRIEVAL_QUERY`; both use
//! the same model and output dimension.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingProviderConfig;
use crate::core::embedding::provider::{
    validate_vector, EmbedPurpose, EmbeddingProvider, ProviderError,
};
#[cfg(feature = "ai-providers")]
use crate::core::embedding::provider::{classify_status, parse_retry_after};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Gemini Provider
// =============================================================================

/// Gemini embedding provider
pub struct GeminiEmbeddingProvider {
    /// API key
    #[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
    api_key: String,
    /// Base URL for API requests
    #[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
    base_url: String,
    /// Embedding model
    model: String,
    /// Output dimension
    dimension: usize,
    /// HTTP client
    #[cfg(feature = "ai-providers")]
    client: reqwest::Client,
}

impl GeminiEmbeddingProvider {
    /// Default Gemini API base URL
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    /// Default embedding model
    pub const DEFAULT_MODEL: &'static str = "text-embedding-004";

    /// Creates a new Gemini provider
    pub fn new(config: &EmbeddingProviderConfig, api_key: Option<String>) -> CoreResult<Self> {
        let api_key = api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Gemini API key is required (set {})",
                    config.api_key_env
                ))
            })?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());

        #[cfg(feature = "ai-providers")]
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension: config.dimension,
            #[cfg(feature = "ai-providers")]
            client,
        })
    }

    #[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
    fn build_request(&self, text: &str, purpose: EmbedPurpose) -> EmbedContentRequest {
        EmbedContentRequest {
            model: format!("models/{}", self.model),
            content: Content {
                parts: vec![Part {
                    text: text.to_string(),
                }],
            },
            task_type: task_type(purpose).to_string(),
            output_dimensionality: self.dimension,
        }
    }
}

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
fn task_type(purpose: EmbedPurpose) -> &'static str {
    match purpose {
        EmbedPurpose::Document => "RETRIEVAL_DOCUMENT",
        EmbedPurpose::Query => "RETRIEVAL_QUERY",
    }
}

/// Validates an `embedContent` response body
#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
fn parse_response(body: &str) -> Result<Vec<f32>, ProviderError> {
    let response: EmbedContentResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::Permanent(format!("Failed to parse Gemini embedding response: {}", e))
    })?;
    validate_vector(response.embedding.values)
}

// =============================================================================
// API Types
// =============================================================================

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest {
    model: String,
    content: Content,
    task_type: String,
    output_dimensionality: usize,
}

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
#[derive(Serialize)]
struct Part {
    text: String,
}

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
#[derive(Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

// =============================================================================
// EmbeddingProvider Implementation
// =============================================================================

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    #[cfg(feature = "ai-providers")]
    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/models/{}:embedContent", self.base_url, self.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.build_request(text, purpose))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("Embedding request failed: {}", e)))?;

        let status = response.status();
        let retry_after = parse_retry_after(
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), retry_after, &body));
        }

        parse_response(&body)
    }

    #[cfg(not(feature = "ai-providers"))]
    async fn embed(&self, _text: &str, _purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Permanent(
            "AI providers feature not enabled. Build with --features ai-providers".to_string(),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
