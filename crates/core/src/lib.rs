//! Core domain types and shared logic for hoard.
//!
//! This crate defines the pieces every other crate agrees on:
//! - Content fingerprints (the dedup key)
//! - File identifiers, kinds, and upload/delete outcomes
//! - Configuration

pub mod config;
pub mod error;
pub mod file;
pub mod hash;

pub use error::{Error, Result};
pub use file::{DeleteOutcome, FileId, FileKind, UploadKind, UploadOutcome};
pub use hash::{ContentHash, ContentHasher};

/// Default maximum upload size: 100 GiB
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024 * 1024;

/// Default in-memory buffering threshold: 32 MiB
pub const DEFAULT_MAX_MEMORY_BUFFER: u64 = 32 * 1024 * 1024;

/// Chunk index used for whole-file content.
pub const WHOLE_FILE_CHUNK_INDEX: i32 = 0;
