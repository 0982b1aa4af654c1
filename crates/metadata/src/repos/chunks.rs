//! Chunk repository.

use crate::error::MetadataResult;
use crate::models::ChunkRow;
use async_trait::async_trait;
use hoard_core::FileId;

/// Repository for chunk operations.
///
/// Chunks record which fingerprinted pieces make up an original's blob.
/// Whole-file uploads produce a single chunk at index 0.
#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// Insert a chunk record. A duplicate `(file_id, chunk_index)` is
    /// reported as `AlreadyExists`.
    async fn insert_chunk(&self, chunk: &ChunkRow) -> MetadataResult<()>;

    /// Chunks of a file ordered by index.
    async fn get_chunks_for_file(&self, file_id: FileId) -> MetadataResult<Vec<ChunkRow>>;

    /// Delete all chunk records of a file, returning how many were removed.
    async fn delete_chunks_for_file(&self, file_id: FileId) -> MetadataResult<u64>;
}
