//! Embedding Provider Interface
//!
//! Defines the trait every embedding backend implements, the failure
//! taxonomy the retry loop dispatches on, and the response validation shared
//! by HTTP providers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::CoreError;

// =============================================================================
// Types
// =============================================================================

/// What a text is embedded for. Both purposes use the same model and dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmbedPurpose {
    /// Chunk text stored in the index
    Document,
    /// Query text searched against the index
    Query,
}

/// Failure reported by an embedding provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Quota or rate limit hit; `retry_after` is the provider's hint, if any
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Network failure or server error worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invalid input, auth failure or malformed response
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Converts to the crate error after `attempts` calls. `reset_in` is the
    /// quota window opened for a rate limit.
    pub fn into_core_error(self, attempts: u32, reset_in: Duration) -> CoreError {
        match self {
            ProviderError::RateLimited { .. } => CoreError::QuotaExhausted { reset_in },
            ProviderError::Transient(message) => CoreError::EmbeddingTransient { attempts, message },
            ProviderError::Permanent(message) => CoreError::EmbeddingPermanent(message),
        }
    }
}

/// Embedding backend
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the provider name
    fn name(&self) -> &str;

    /// Returns the model identifier
    fn model(&self) -> &str;

    /// Dimension of every vector this provider returns
    fn dimension(&self) -> usize;

    /// Embeds a single text
    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError>;
}

// =============================================================================
// Response Classification
// =============================================================================

/// Maps an HTTP failure status to a provider error.
///
/// 429 is a rate limit, 408 and 5xx are transient, every other status is
/// permanent.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let message = format!("HTTP {}: {}", status, truncate(body, 300));
    match status {
        429 => ProviderError::RateLimited {
            retry_after,
            message,
        },
        408 | 500..=599 => ProviderError::Transient(message),
        _ => ProviderError::Permanent(message),
    }
}

/// Parses a `Retry-After` header given in seconds
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Rejects empty or non-finite vectors
pub fn validate_vector(values: Vec<f32>) -> Result<Vec<f32>, ProviderError> {
    if values.is_empty() {
        return Err(ProviderError::Permanent(
            "provider returned an empty embedding".to_string(),
        ));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ProviderError::Permanent(
            "provider returned a non-finite embedding component".to_string(),
        ));
    }
    Ok(values)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

// =============================================================================
// Mock Provider (for testing)
// =============================================================================

/// Deterministic provider for tests and offline use.
///
/// Embeds text as a normalized hashed bag of words, so texts sharing words
/// land close together. Failures can be scripted per call or per text.
pub struct MockEmbeddingProvider {
    dimension: usize,
    script: Mutex<VecDeque<ProviderError>>,
    failures_for: Mutex<HashMap<String, ProviderError>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    purposes: Mutex<Vec<EmbedPurpose>>,
}

impl MockEmbeddingProvider {
    /// Creates a provider returning vectors of `dimension` components
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            script: Mutex::new(VecDeque::new()),
            failures_for: Mutex::new(HashMap::new()),
            latency: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            purposes: Mutex::new(Vec::new()),
        }
    }

    /// Fails the next calls with `errors`, in order, before succeeding
    pub fn with_script(self, errors: Vec<ProviderError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(errors);
        }
        self
    }

    /// Fails every call whose text contains `needle`
    pub fn with_failure_for(self, needle: &str, error: ProviderError) -> Self {
        if let Ok(mut failures) = self.failures_for.lock() {
            failures.insert(needle.to_string(), error);
        }
        self
    }

    /// Delays every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Total calls, including failed ones
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Purposes of successful calls, in order
    pub fn purposes(&self) -> Vec<EmbedPurpose> {
        self.purposes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// The embedding this provider returns for `text`
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        hashed_bag_of_words(text, self.dimension)
    }

    fn scripted_failure(&self, text: &str) -> Option<ProviderError> {
        if let Some(err) = self.script.lock().ok().and_then(|mut s| s.pop_front()) {
            return Some(err);
        }
        self.failures_for.lock().ok().and_then(|failures| {
            failures
                .iter()
                .find(|(needle, _)| text.contains(needle.as_str()))
                .map(|(_, err)| err.clone())
        })
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-hashing-bow"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.scripted_failure(text) {
            return Err(err);
        }

        if let Ok(mut purposes) = self.purposes.lock() {
            purposes.push(purpose);
        }
        Ok(self.embed_text(text))
    }
}

/// Normalized hashed bag of lowercase alphanumeric words
fn hashed_bag_of_words(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension.max(1)];
    let mut any = false;

    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let bucket = (fnv1a(&word.to_lowercase()) % vector.len() as u64) as usize;
        vector[bucket] += 1.0;
        any = true;
    }

    if !any {
        vector[0] = 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    vector.iter_mut().for_each(|v| *v /= norm);
    vector.truncate(dimension);
    vector
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

// =============================================================================
// Tests
// =============================================================================
