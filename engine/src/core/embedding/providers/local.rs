//! Local (Ollama) Embedding Provider
//!
//! Calls Ollama's `/api/embeddings` endpoint. No API key is needed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingProviderConfig;
use crate::core::embedding::provider::{
    validate_vector, EmbedPurpose, EmbeddingProvider, ProviderError,
};
#[cfg(feature = "ai-providers")]
use crate::core::embedding::provider::{classify_status, parse_retry_after};
#[cfg(feature = "ai-providers")]
use crate::core::CoreError;
use crate::core::CoreResult;

// =============================================================================
// Local Provider
// =============================================================================

/// Ollama embedding provider
pub struct LocalEmbeddingProvider {
    #[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
    base_url: String,
    model: String,
    dimension: usize,
    #[cfg(feature = "ai-providers")]
    client: reqwest::Client,
}

impl LocalEmbeddingProvider {
    /// Default Ollama API URL
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:11434";

    /// Default embedding model
    pub const DEFAULT_MODEL: &'static str = "nomic-embed-text";

    /// Creates a new local provider
    pub fn new(config: &EmbeddingProviderConfig) -> CoreResult<Self> {
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
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension: config.dimension,
            #[cfg(feature = "ai-providers")]
            client,
        })
    }

    #[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
    fn build_request(&self, text: &str, purpose: EmbedPurpose) -> EmbeddingRequest {
        // nomic-embed-text expects a task prefix on every input.
        let prefix = match purpose {
            EmbedPurpose::Document => "search_document: ",
            EmbedPurpose::Query => "search_query: ",
        };
        EmbeddingRequest {
            model: self.model.clone(),
            prompt: format!("{}{}", prefix, text),
        }
    }
}

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
fn parse_response(body: &str) -> Result<Vec<f32>, ProviderError> {
    let response: EmbeddingResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::Permanent(format!("Failed to parse Ollama embedding response: {}", e))
    })?;
    validate_vector(response.embedding)
}

// =============================================================================
// API Types
// =============================================================================

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    prompt: String,
}

#[cfg_attr(not(feature = "ai-providers"), allow(dead_code))]
#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

// =============================================================================
// EmbeddingProvider Implementation
// =============================================================================

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    #[cfg(feature = "ai-providers")]
    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/api/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::embedding::providers::EmbeddingProviderKind;

    fn config() -> EmbeddingProviderConfig {
        EmbeddingProviderConfig {
            kind: EmbeddingProviderKind::Local,
            ..EmbeddingProviderConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let provider = LocalEmbeddingProvider::new(&config()).unwrap();
        assert_eq!(provider.model(), "nomic-embed-text");
        assert_eq!(provider.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_request_prefixes_by_purpose() {
        let provider = LocalEmbeddingProvider::new(&config()).unwrap();

        let doc = provider.build_request("intro", EmbedPurpose::Document);
        let query = provider.build_request("intro", EmbedPurpose::Query);

        assert_eq!(doc.prompt, "search_document: intro");
        assert_eq!(query.prompt, "search_query: intro");
        assert_eq!(doc.model, query.model);
    }

    #[test]
    fn test_parse_response() {
        assert_eq!(
            parse_response(r#"{"embedding":[1.0,0.0]}"#).unwrap(),
            vec![1.0, 0.0]
        );
        assert!(parse_response(r#"{"embeddings":[[1.0]]}"#).is_err());
    }
}
