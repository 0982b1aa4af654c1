//! Database models mapping to the metadata schema.

use hoard_core::FileId;
use sqlx::FromRow;
use time::OffsetDateTime;

/// File record.
///
/// Exactly one of `file_hash` (original) or `parent_file_id` (reference)
/// is set; the schema enforces this with a CHECK constraint.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub id: i64,
    pub name: String,
    pub user_id: String,
    #[sqlx(rename = "type")]
    pub file_type: String,
    /// Content is durably stored and usable.
    pub ready: bool,
    pub file_hash: Option<String>,
    pub parent_file_id: Option<i64>,
    pub created_at: OffsetDateTime,
}

impl FileRow {
    pub fn file_id(&self) -> FileId {
        FileId::new(self.id)
    }

    pub fn is_reference(&self) -> bool {
        self.parent_file_id.is_some()
    }

    /// Id of the original whose blob backs this record.
    pub fn lineage_id(&self) -> FileId {
        FileId::new(self.parent_file_id.unwrap_or(self.id))
    }
}

/// Chunk record. One per original today, at index 0.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub user_id: String,
    pub file_id: i64,
    pub chunk_hash: String,
    pub chunk_index: i32,
    pub created_at: OffsetDateTime,
}

/// Result of removing a reference record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceRemoval {
    /// Original the reference pointed to.
    pub lineage_id: FileId,
    /// True when the removed reference was the last record backing the
    /// lineage's blob (the original had already been deleted).
    pub blob_orphaned: bool,
}
