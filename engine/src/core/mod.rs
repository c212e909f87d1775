//! ReelIndex Core
//!
//! Transcript fetching, chunking, embedding, vector indexing, ranking and
//! ingestion orchestration for the retrieval engine.

pub mod chunking;
pub mod embedding;
pub mod fs;
pub mod index;
pub mod ingest;
pub mod search;
pub mod settings;
pub mod store;
pub mod transcript;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;
