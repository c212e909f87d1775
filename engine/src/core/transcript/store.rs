//! Segment Store
//!
//! Ordered transcript segments per video. Transcripts are fetched once from
//! the provider, sanitized, and cached as immutable `Arc<Transcript>` values.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::models::Transcript;
use super::provider::TranscriptProvider;
use crate::core::CoreResult;

/// Per-video cache in front of a [`TranscriptProvider`]
pub struct SegmentStore {
    provider: Arc<dyn TranscriptProvider>,
    preferred_languages: Vec<String>,
    cache: RwLock<HashMap<String, Arc<Transcript>>>,
}

impl SegmentStore {
    /// Creates a store with the given language preference order
    pub fn new(provider: Arc<dyn TranscriptProvider>, preferred_languages: Vec<String>) -> Self {
        Self {
            provider,
            preferred_languages,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the configured language preference order
    pub fn preferred_languages(&self) -> &[String] {
        &self.preferred_languages
    }

    /// Returns the ordered segments of `video_id`, fetching on first use.
    pub async fn segments(&self, video_id: &str) -> CoreResult<Arc<Transcript>> {
        if let Some(cached) = self.cache.read().await.get(video_id) {
            return Ok(Arc::clone(cached));
        }

        let mut transcript = self
            .provider
            .fetch_transcript(video_id, &self.preferred_languages)
            .await?;
        let dropped = transcript.sanitize();

        tracing::info!(
            video_id = %video_id,
            provider = self.provider.name(),
            language = transcript.language.as_deref().unwrap_or("unknown"),
            segment_count = transcript.segments.len(),
            dropped,
            "Fetched transcript"
        );

        let transcript = Arc::new(transcript);
        let mut cache = self.cache.write().await;
        let entry = cache
            .entry(video_id.to_string())
            .or_insert_with(|| Arc::clone(&transcript));
        Ok(Arc::clone(entry))
    }

    /// Drops the cached transcript so the next read refetches it
    pub async fn evict(&self, video_id: &str) -> bool {
        self.cache.write().await.remove(video_id).is_some()
    }

    /// Number of cached transcripts
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transcript::MockTranscriptProvider;

    fn store_with(provider: Arc<MockTranscriptProvider>) -> SegmentStore {
        SegmentStore::new(provider, vec!["en".to_string()])
    }

    #[tokio::test]
    async fn test_segments_are_cached() {
        let provider = Arc::new(
            MockTranscriptProvider::new().with_transcript("vid", "en", &[(0.0, 5.0, "hello")]),
        );
        let store = store_with(Arc::clone(&provider));

        let first = store.segments("vid").await.unwrap();
        let second = store.segments("vid").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.calls().len(), 1);
        assert_eq!(store.cached_count().await, 1);
    }

    #[tokio::test]
    async fn test_segments_are_sanitized() {
        let provider = Arc::new(MockTranscriptProvider::new().with_transcript(
            "vid",
            "en",
            &[(10.0, 12.0, "second"), (5.0, 1.0, "broken"), (0.0, 2.0, "first")],
        ));
        let store = store_with(provider);

        let transcript = store.segments("vid").await.unwrap();

        let texts: Vec<_> = transcript.segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_evict_forces_refetch() {
        let provider = Arc::new(
            MockTranscriptProvider::new().with_transcript("vid", "en", &[(0.0, 5.0, "hello")]),
        );
        let store = store_with(Arc::clone(&provider));

        store.segments("vid").await.unwrap();
        assert!(store.evict("vid").await);
        assert!(!store.evict("vid").await);
        store.segments("vid").await.unwrap();

        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_cached() {
        let provider = Arc::new(MockTranscriptProvider::new());
        let store = store_with(Arc::clone(&provider));

        assert!(store.segments("missing").await.is_err());
        assert_eq!(store.cached_count().await, 0);
    }
}
