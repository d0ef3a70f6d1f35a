//! HTTP/REST API layer for Gatekeep.
//!
//! Axum-based REST API at `/api/v1/` with caller identification, envelope
//! response format, CORS support, and a WebSocket event stream.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
