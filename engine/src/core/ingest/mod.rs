//! Ingestion Module
//!
//! Per-video processing state, the ingestion pipeline, and the background
//! worker pool that runs it.

mod registry;
mod service;
mod worker;

pub use registry::*;
pub use service::*;
pub use worker::*;
