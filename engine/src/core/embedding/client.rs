//! Embedding Client
//!
//! Wraps an [`EmbeddingProvider`] with the retry and quota discipline:
//!
//! - transient failures retry on the [`BackoffPolicy`] schedule
//! - rate limits open a window on the shared [`QuotaGate`]; after the window
//!   the call resumes with backoff reset to baseline
//! - permanent failures and dimension mismatches surface immediately
//!
//! Every suspension point (provider call, retry delay, quota wait) observes
//! the caller's cancellation token.

use std::sync::Arc;

use futures::{FutureExt, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use super::clock::Sleeper;
use super::policy::BackoffPolicy;
use super::provider::{EmbedPurpose, EmbeddingProvider, ProviderError};
use super::quota::QuotaGate;
use crate::core::{CoreError, CoreResult};

/// Per-call options
#[derive(Clone, Debug)]
pub struct EmbedOptions {
    /// Wait out quota windows instead of failing fast
    pub blocking: bool,
    /// Cancels the call at its next suspension point
    pub cancel: CancellationToken,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            cancel: CancellationToken::new(),
        }
    }
}

impl EmbedOptions {
    /// Blocking call tied to `cancel`
    pub fn blocking(cancel: CancellationToken) -> Self {
        Self {
            blocking: true,
            cancel,
        }
    }

    /// Call that fails with `QuotaExhausted` instead of waiting
    pub fn non_blocking(cancel: CancellationToken) -> Self {
        Self {
            blocking: false,
            cancel,
        }
    }
}

/// Embedding client with retry and quota handling
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    quota: Arc<QuotaGate>,
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    dimension: usize,
    batch_limit: usize,
}

impl EmbeddingClient {
    /// Creates a client sharing `quota` with every other client of the process
    pub fn new(provider: Arc<dyn EmbeddingProvider>, quota: Arc<QuotaGate>, policy: BackoffPolicy) -> Self {
        let dimension = provider.dimension();
        let sleeper = quota.sleeper();
        Self {
            provider,
            quota,
            policy,
            sleeper,
            dimension,
            batch_limit: 4,
        }
    }

    /// Sets how many embedding calls one batch may run concurrently
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Model recorded alongside stored vectors
    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn quota(&self) -> &Arc<QuotaGate> {
        &self.quota
    }

    /// Embeds one text.
    pub async fn embed(&self, text: &str, purpose: EmbedPurpose, options: &EmbedOptions) -> CoreResult<Vec<f32>> {
        let cancel = &options.cancel;
        let mut attempt: u32 = 0;
        let mut quota_waits: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled("embedding cancelled".to_string()));
            }

            self.quota.wait_until_available(options.blocking, cancel).await?;

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoreError::Cancelled("embedding cancelled".to_string()));
                }
                result = self.provider.embed(text, purpose) => result,
            };

            let provider_error = match result {
                Ok(vector) => {
                    self.quota.record_success();
                    if vector.len() != self.dimension {
                        return Err(CoreError::DimensionMismatch {
                            expected: self.dimension,
                            actual: vector.len(),
                        });
                    }
                    return Ok(vector);
                }
                Err(provider_error) => provider_error,
            };

            let window = match &provider_error {
                ProviderError::RateLimited { retry_after, .. } => {
                    Some(self.quota.record_rate_limited(*retry_after))
                }
                _ => None,
            };
            let error = provider_error.into_core_error(attempt + 1, window.unwrap_or_default());
            if !error.is_retryable() {
                return Err(error);
            }

            if window.is_some() {
                quota_waits += 1;
                if quota_waits > self.quota.config().max_quota_waits {
                    tracing::warn!(
                        provider = self.provider.name(),
                        quota_waits,
                        "Giving up after repeated quota windows: {}",
                        error
                    );
                    return Err(error);
                }
                // Backoff restarts from baseline once the window closes.
                attempt = 0;
                continue;
            }

            if attempt >= self.policy.max_retries {
                return Err(error);
            }

            let delay = self.policy.jittered_delay_for(attempt);
            tracing::warn!(
                provider = self.provider.name(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Embedding attempt failed, retrying: {}",
                error
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoreError::Cancelled("embedding cancelled".to_string()));
                }
                _ = self.sleeper.sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Embeds a query text
    pub async fn embed_query(&self, text: &str, options: &EmbedOptions) -> CoreResult<Vec<f32>> {
        self.embed(text, EmbedPurpose::Query, options).await
    }

    /// Embeds `texts` with at most `batch_limit` calls in flight.
    ///
    /// Output order matches input order. The first failure aborts the batch
    /// and drops the calls still in flight.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        purpose: EmbedPurpose,
        options: &EmbedOptions,
    ) -> CoreResult<Vec<Vec<f32>>> {
        let mut calls = Vec::with_capacity(texts.len());
        for text in texts {
            calls.push(self.embed(text, purpose, options).boxed());
        }
        futures::stream::iter(calls)
            .buffered(self.batch_limit)
            .try_collect()
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::core::embedding::clock::{ManualClock, RecordingSleeper};
    use crate::core::embedding::provider::MockEmbeddingProvider;
    use crate::core::embedding::quota::QuotaConfig;

    const DIM: usize = 16;

    fn transient() -> ProviderError {
        ProviderError::Transient("503 Service Unavailable".to_string())
    }

    fn rate_limited() -> ProviderError {
        ProviderError::RateLimited {
            retry_after: None,
            message: "429 Too Many Requests".to_string(),
        }
    }

    fn manual_client(provider: MockEmbeddingProvider) -> (EmbeddingClient, Arc<MockEmbeddingProvider>, RecordingSleeper) {
        let clock = ManualClock::new();
        let sleeper = RecordingSleeper::with_clock(clock.clone());
        let quota = Arc::new(QuotaGate::with_time(
            QuotaConfig::default(),
            Arc::new(clock),
            Arc::new(sleeper.clone()),
        ));
        let provider = Arc::new(provider);
        let client = EmbeddingClient::new(
            Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
            quota,
            BackoffPolicy::new(Duration::from_secs(5), 3),
        );
        (client, provider, sleeper)
    }

    // -------------------------------------------------------------------------
    // Transient retries
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_two_transient_failures_then_success() {
        let provider = Arc::new(MockEmbeddingProvider::new(DIM).with_script(vec![transient(), transient()]));
        let client = EmbeddingClient::new(
            Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
            Arc::new(QuotaGate::new(QuotaConfig::default())),
            BackoffPolicy::new(Duration::from_secs(5), 3),
        );

        let start = Instant::now();
        let vector = client
            .embed("gradient descent", EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap();

        assert_eq!(vector.len(), DIM);
        assert!(start.elapsed() >= Duration::from_secs(5 + 10));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_schedule_doubles() {
        let (client, _, sleeper) =
            manual_client(MockEmbeddingProvider::new(DIM).with_script(vec![transient(), transient()]));

        client
            .embed("x", EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap();

        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(5), Duration::from_secs(10)]);
    }

    #[tokio::test]
    async fn test_transient_exhaustion() {
        let (client, provider, _) = manual_client(
            MockEmbeddingProvider::new(DIM).with_script(vec![transient(); 4]),
        );

        let err = client
            .embed("x", EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap_err();

        match err {
            CoreError::EmbeddingTransient { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(provider.call_count(), 4);
    }

    // -------------------------------------------------------------------------
    // Permanent and structural failures
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (client, provider, sleeper) = manual_client(
            MockEmbeddingProvider::new(DIM)
                .with_script(vec![ProviderError::Permanent("401 invalid key".to_string())]),
        );

        let err = client
            .embed("x", EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::EmbeddingPermanent(_)));
        assert_eq!(provider.call_count(), 1);
        assert!(sleeper.sleeps().is_empty());
    }

    /// Declares one dimension and returns vectors of another
    struct ShortVectorProvider;

    #[async_trait::async_trait]
    impl EmbeddingProvider for ShortVectorProvider {
        fn name(&self) -> &str {
            "short"
        }

        fn model(&self) -> &str {
            "short-model"
        }

        fn dimension(&self) -> usize {
            DIM
        }

        async fn embed(&self, _text: &str, _purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![0.5; 8])
        }
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let client = EmbeddingClient::new(
            Arc::new(ShortVectorProvider),
            Arc::new(QuotaGate::new(QuotaConfig::default())),
            BackoffPolicy::new(Duration::from_secs(5), 3),
        );

        let err = client
            .embed("x", EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::DimensionMismatch { expected: 16, actual: 8 }));
        assert!(err.is_structural());
    }

    // -------------------------------------------------------------------------
    // Quota
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_rate_limit_waits_window_then_resumes() {
        let (client, provider, sleeper) = manual_client(
            MockEmbeddingProvider::new(DIM).with_script(vec![rate_limited(), transient()]),
        );

        client
            .embed("x", EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap();

        // Quota window, then a retry delay starting from baseline.
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(60), Duration::from_secs(5)]);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(client.quota().status().strikes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_mid_window_waits_remainder() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbeddingProvider::new(DIM));
        let quota = Arc::new(QuotaGate::new(QuotaConfig::default()));
        let client = EmbeddingClient::new(provider, Arc::clone(&quota), BackoffPolicy::default());

        quota.record_rate_limited(None);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let start = Instant::now();
        client
            .embed_query("gradient descent", &EmbedOptions::default())
            .await
            .unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(50));
        assert!(waited < Duration::from_secs(51));
    }

    #[tokio::test]
    async fn test_non_blocking_caller_gets_quota_exhausted() {
        let (client, _, _) = manual_client(MockEmbeddingProvider::new(DIM));
        client.quota().record_rate_limited(None);

        let err = client
            .embed_query("x", &EmbedOptions::non_blocking(CancellationToken::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::QuotaExhausted { .. }));
    }

    #[tokio::test]
    async fn test_quota_waits_are_bounded() {
        let (client, provider, _) =
            manual_client(MockEmbeddingProvider::new(DIM).with_script(vec![rate_limited(); 10]));

        let err = client
            .embed("x", EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::QuotaExhausted { .. }));
        assert_eq!(provider.call_count(), 4);
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_delay() {
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::new(MockEmbeddingProvider::new(DIM).with_script(vec![transient(); 3]));
        let client = Arc::new(EmbeddingClient::new(
            provider,
            Arc::new(QuotaGate::new(QuotaConfig::default())),
            BackoffPolicy::new(Duration::from_secs(5), 3),
        ));

        let cancel = CancellationToken::new();
        let task = {
            let client = Arc::clone(&client);
            let options = EmbedOptions::blocking(cancel.clone());
            tokio::spawn(async move { client.embed("x", EmbedPurpose::Document, &options).await })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(CoreError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_call() {
        let (client, provider, _) = manual_client(MockEmbeddingProvider::new(DIM));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .embed("x", EmbedPurpose::Document, &EmbedOptions::blocking(cancel))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Cancelled(_)));
        assert_eq!(provider.call_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Batches
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_batch_preserves_order_and_limit() {
        let provider = Arc::new(MockEmbeddingProvider::new(DIM).with_latency(Duration::from_millis(100)));
        let client = EmbeddingClient::new(
            Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
            Arc::new(QuotaGate::new(QuotaConfig::default())),
            BackoffPolicy::default(),
        )
        .with_batch_limit(3);

        let texts: Vec<String> = (0..10).map(|i| format!("chunk number {i}")).collect();
        let vectors = client
            .embed_batch(&texts, EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap();

        assert_eq!(vectors.len(), 10);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &provider.embed_text(text));
        }
        assert!(provider.max_in_flight() <= 3);
        assert!(provider.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_batch_fails_on_first_error() {
        let (client, _, _) = manual_client(
            MockEmbeddingProvider::new(DIM)
                .with_failure_for("bad", ProviderError::Permanent("rejected".to_string())),
        );
        let texts = vec!["good".to_string(), "bad".to_string(), "good again".to_string()];

        let err = client
            .embed_batch(&texts, EmbedPurpose::Document, &EmbedOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::EmbeddingPermanent(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_runs_on_spawned_task() {
        let client = Arc::new(
            EmbeddingClient::new(
                Arc::new(MockEmbeddingProvider::new(DIM).with_latency(Duration::from_millis(50))),
                Arc::new(QuotaGate::new(QuotaConfig::default())),
                BackoffPolicy::default(),
            )
            .with_batch_limit(2),
        );

        let task = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let texts: Vec<String> = (0..5).map(|i| format!("segment {i}")).collect();
                client
                    .embed_batch(&texts, EmbedPurpose::Document, &EmbedOptions::default())
                    .await
            })
        };

        assert_eq!(task.await.unwrap().unwrap().len(), 5);
    }
}
