//! IPC Layer
//!
//! Request/response DTOs and handlers that hosts (a desktop shell, an HTTP
//! server, a CLI) expose over their own transport.

mod api;
mod dto;

pub use api::*;
pub use dto::*;
