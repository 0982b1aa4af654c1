//! HTTP service for deduplicated file storage.
//!
//! This crate provides:
//! - The dedup coordinator that keeps the metadata and blob stores consistent
//! - Upload and delete endpoints
//! - Health and Prometheus metrics endpoints

pub mod dedup;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use dedup::{DedupCoordinator, DedupError, StagedContent, UploadRequest};
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
