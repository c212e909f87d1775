//! Transcript Module
//!
//! Timestamped transcript segments, the provider seam that supplies them and
//! the per-video segment cache.

mod models;
mod provider;
mod store;

pub use models::*;
pub use provider::*;
pub use store::*;
