//! Embedding Provider Implementations
//!
//! Concrete HTTP backends and the factory that builds one from settings.

mod gemini;
mod local;

pub use gemini::GeminiEmbeddingProvider;
pub use local::LocalEmbeddingProvider;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::provider::{EmbeddingProvider, MockEmbeddingProvider};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Provider Configuration
// =============================================================================

/// Supported embedding backends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Google Gemini `embedContent`
    #[default]
    Gemini,
    /// Ollama running locally
    Local,
    /// Deterministic hashing embedder (offline)
    Mock,
}

impl std::fmt::Display for EmbeddingProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingProviderKind::Gemini => write!(f, "gemini"),
            EmbeddingProviderKind::Local => write!(f, "local"),
            EmbeddingProviderKind::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for EmbeddingProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(EmbeddingProviderKind::Gemini),
            "local" | "ollama" => Ok(EmbeddingProviderKind::Local),
            "mock" => Ok(EmbeddingProviderKind::Mock),
            _ => Err(format!("Unknown embedding provider: {}", s)),
        }
    }
}

/// Configuration for creating an embedding provider.
///
/// The API key itself is never stored here; it is read from the environment
/// variable named by `api_key_env`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingProviderConfig {
    /// Backend
    pub kind: EmbeddingProviderKind,
    /// Model override (provider default when unset)
    pub model: Option<String>,
    /// Base URL override
    pub base_url: Option<String>,
    /// Vector dimension for this deployment
    pub dimension: usize,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self {
            kind: EmbeddingProviderKind::Gemini,
            model: None,
            base_url: None,
            dimension: 768,
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

// =============================================================================
// Provider Factory
// =============================================================================

/// Creates an embedding provider from configuration
pub fn create_embedding_provider(
    config: &EmbeddingProviderConfig,
) -> CoreResult<Arc<dyn EmbeddingProvider>> {
    if config.dimension == 0 {
        return Err(CoreError::ValidationError(
            "embedding dimension must be positive".to_string(),
        ));
    }

    match config.kind {
        EmbeddingProviderKind::Gemini => {
            let api_key = std::env::var(&config.api_key_env).ok();
            let provider = GeminiEmbeddingProvider::new(config, api_key)?;
            Ok(Arc::new(provider))
        }
        EmbeddingProviderKind::Local => {
            let provider = LocalEmbeddingProvider::new(config)?;
            Ok(Arc::new(provider))
        }
        EmbeddingProviderKind::Mock => Ok(Arc::new(MockEmbeddingProvider::new(config.dimension))),
    }
}

// =============================================================================
// Tests
// =============================================================================
