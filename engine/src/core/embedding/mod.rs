//! Embedding Module
//!
//! Turns chunk and query text into fixed-dimension vectors through an
//! external provider, with retry/backoff and process-wide quota handling.

mod client;
mod clock;
mod policy;
mod provider;
pub mod providers;
mod quota;

pub use client::{EmbedOptions, EmbeddingClient};
pub use clock::{Clock, ManualClock, RecordingSleeper, Sleeper, TokioClock, TokioSleeper};
pub use policy::BackoffPolicy;
pub(crate) use policy::duration_ms;
pub use provider::{
    classify_status, parse_retry_after, validate_vector, EmbedPurpose, EmbeddingProvider,
    MockEmbeddingProvider, ProviderError,
};
pub use providers::{create_embedding_provider, EmbeddingProviderConfig, EmbeddingProviderKind};
pub use quota::{QuotaConfig, QuotaGate, QuotaStatus};
