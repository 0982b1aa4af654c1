//! Dedup coordinator.
//!
//! Upload and delete span two stores: a transactional metadata store and a
//! non-transactional blob store. Each operation runs as a small saga:
//!
//! - Upload reserves a not-ready original record (the fingerprint's unique
//!   constraint decides which concurrent uploader wins), writes the blob
//!   under the record id, then flips `ready`. A failed or cancelled blob
//!   write deletes the reservation again.
//! - Delete removes one record and purges the blob only when the metadata
//!   store reports, in the same transaction, that nothing else points at it.
//!
//! Uniqueness conflicts are control flow, not errors: the losing side
//! re-runs the lookup and lands on the winner's record.

use crate::metrics;
use bytes::Bytes;
use hoard_core::{
    ContentHash, DeleteOutcome, FileId, UploadKind, UploadOutcome, WHOLE_FILE_CHUNK_INDEX,
};
use hoard_metadata::{ChunkRow, FileRow, MetadataError, MetadataStore};
use hoard_storage::{ObjectStore, StorageError};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Upper bound on lookup/reserve rounds for a single upload.
pub const MAX_ATTEMPTS: u32 = 5;

/// Coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("file not found")]
    NotFound,

    #[error("upload cancelled")]
    Cancelled,

    #[error("blob store error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DedupError {
    /// Label used for the failure metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
            Self::Storage(_) => "storage",
            Self::Metadata(_) => "metadata",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type for coordinator operations.
pub type DedupResult<T> = std::result::Result<T, DedupError>;

/// Whole-content upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: String,
    pub name: String,
    pub content_type: Option<String>,
    pub content: Bytes,
}

/// Content already spooled to a staging object and fingerprinted on the way.
#[derive(Debug, Clone)]
pub struct StagedContent {
    /// Blob store key of the staging object.
    pub key: String,
    pub hash: ContentHash,
    pub size: u64,
}

/// Where the bytes of a new original come from.
enum BlobSource<'a> {
    Memory {
        data: &'a Bytes,
        content_type: Option<&'a str>,
    },
    Staged {
        key: &'a str,
    },
}

/// One round of the upload protocol.
enum Step {
    Done(UploadOutcome),
    Retry(&'static str),
}

/// Runs uploads and deletes against the metadata and blob stores.
#[derive(Clone)]
pub struct DedupCoordinator {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
}

impl DedupCoordinator {
    pub fn new(metadata: Arc<dyn MetadataStore>, storage: Arc<dyn ObjectStore>) -> Self {
        Self { metadata, storage }
    }

    /// Upload content held in memory.
    #[tracing::instrument(
        skip(self, request, cancel),
        fields(user_id = %request.user_id, size = request.content.len())
    )]
    pub async fn upload(
        &self,
        request: UploadRequest,
        cancel: CancellationToken,
    ) -> DedupResult<UploadOutcome> {
        validate_owner(&request.user_id, &request.name)?;
        let hash = ContentHash::compute(&request.content);
        let source = BlobSource::Memory {
            data: &request.content,
            content_type: request.content_type.as_deref(),
        };
        self.run_upload(
            &request.user_id,
            &request.name,
            &hash,
            request.content.len() as u64,
            source,
            &cancel,
        )
        .await
    }

    /// Upload content that was streamed to a staging object.
    ///
    /// A new original is materialized with a server-side copy, so the
    /// content type recorded on the staging object carries over. The staging
    /// object is removed whatever the outcome.
    #[tracing::instrument(
        skip(self, name, staged, cancel),
        fields(user_id = %user_id, staging_key = %staged.key, size = staged.size)
    )]
    pub async fn upload_staged(
        &self,
        user_id: &str,
        name: &str,
        staged: StagedContent,
        cancel: CancellationToken,
    ) -> DedupResult<UploadOutcome> {
        let result = match validate_owner(user_id, name) {
            Ok(()) => {
                let source = BlobSource::Staged { key: &staged.key };
                self.run_upload(user_id, name, &staged.hash, staged.size, source, &cancel)
                    .await
            }
            Err(e) => Err(e),
        };
        self.discard_staging(&staged.key).await;
        result
    }

    async fn run_upload(
        &self,
        user_id: &str,
        name: &str,
        hash: &ContentHash,
        size: u64,
        source: BlobSource<'_>,
        cancel: &CancellationToken,
    ) -> DedupResult<UploadOutcome> {
        let _timer = metrics::UPLOAD_DURATION.start_timer();
        let file_hash = hash.to_hex();

        let result = self
            .settle(user_id, name, &file_hash, size, &source, cancel)
            .await;
        match &result {
            Ok(outcome) => metrics::record_upload(outcome.kind, size),
            Err(e) => metrics::record_upload_failure(e.kind()),
        }
        result
    }

    async fn settle(
        &self,
        user_id: &str,
        name: &str,
        file_hash: &str,
        size: u64,
        source: &BlobSource<'_>,
        cancel: &CancellationToken,
    ) -> DedupResult<UploadOutcome> {
        for attempt in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(DedupError::Cancelled);
            }
            match self
                .attempt(user_id, name, file_hash, size, source, cancel)
                .await?
            {
                Step::Done(outcome) => return Ok(outcome),
                Step::Retry(reason) => {
                    tracing::debug!(attempt, file_hash = %file_hash, reason, "Upload lost a race, retrying lookup");
                }
            }
        }

        Err(DedupError::Internal(format!(
            "upload of {file_hash} did not settle after {MAX_ATTEMPTS} attempts"
        )))
    }

    async fn attempt(
        &self,
        user_id: &str,
        name: &str,
        file_hash: &str,
        size: u64,
        source: &BlobSource<'_>,
        cancel: &CancellationToken,
    ) -> DedupResult<Step> {
        if let Some(original) = self.metadata.find_original_by_hash(file_hash).await? {
            return self.link(user_id, name, file_hash, &original).await;
        }

        // The user may still hold a reference into a lineage whose original
        // was deleted; that record already covers this content.
        if let Some(existing) = self
            .metadata
            .find_user_record(user_id, file_hash, None)
            .await?
        {
            return Ok(Step::Done(UploadOutcome {
                file_id: existing.file_id(),
                kind: UploadKind::AlreadyUploaded,
            }));
        }

        let reserved = match self
            .metadata
            .reserve_original(user_id, name, file_hash)
            .await
        {
            Ok(row) => row,
            Err(e) if e.is_conflict() => return Ok(Step::Retry("fingerprint reserved concurrently")),
            Err(e) => return Err(e.into()),
        };

        let file_id = reserved.file_id();
        tracing::debug!(file_id = %file_id, "Reserved original, writing blob");
        self.write_blob(file_id, source, cancel).await?;
        self.finalize(user_id, file_id, file_hash).await;

        tracing::info!(file_id = %file_id, size, "Stored new content");
        Ok(Step::Done(UploadOutcome {
            file_id,
            kind: UploadKind::Stored,
        }))
    }

    /// Dedup hit: reuse the user's record or add a reference to `original`.
    async fn link(
        &self,
        user_id: &str,
        name: &str,
        file_hash: &str,
        original: &FileRow,
    ) -> DedupResult<Step> {
        let original_id = original.file_id();
        if let Some(existing) = self
            .metadata
            .find_user_record(user_id, file_hash, Some(original_id))
            .await?
        {
            return Ok(Step::Done(UploadOutcome {
                file_id: existing.file_id(),
                kind: UploadKind::AlreadyUploaded,
            }));
        }

        match self
            .metadata
            .create_reference(user_id, name, original_id)
            .await
        {
            Ok(reference) => {
                tracing::info!(
                    file_id = %reference.id,
                    original_id = %original_id,
                    "Created reference to existing content"
                );
                Ok(Step::Done(UploadOutcome {
                    file_id: reference.file_id(),
                    kind: UploadKind::Reference,
                }))
            }
            Err(e) if e.is_conflict() => Ok(Step::Retry("reference created concurrently")),
            Err(MetadataError::NotFound(_)) => Ok(Step::Retry("original deleted during upload")),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the blob for a fresh reservation, compensating on failure.
    async fn write_blob(
        &self,
        file_id: FileId,
        source: &BlobSource<'_>,
        cancel: &CancellationToken,
    ) -> DedupResult<()> {
        let key = file_id.blob_key();
        let write = async {
            match source {
                BlobSource::Memory { data, content_type } => {
                    self.storage.put(&key, Bytes::clone(data), *content_type).await
                }
                BlobSource::Staged { key: staging_key } => {
                    self.storage.copy(staging_key, &key).await
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DedupError::Cancelled),
            result = write => result.map_err(DedupError::from),
        };

        let Err(error) = outcome else {
            return Ok(());
        };

        match &error {
            DedupError::Cancelled => {
                tracing::warn!(file_id = %file_id, "Upload cancelled during blob write, compensating");
                // The interrupted write may still have landed.
                self.remove_blob_quietly(&key).await;
            }
            e => {
                tracing::warn!(file_id = %file_id, error = %e, "Blob write failed, compensating");
            }
        }
        self.compensate(file_id).await;
        Err(error)
    }

    /// Undo a reservation whose blob never landed.
    async fn compensate(&self, file_id: FileId) {
        metrics::COMPENSATIONS.inc();
        match self.metadata.delete_reservation(file_id).await {
            Ok(0) => {}
            Ok(references) => {
                tracing::warn!(
                    file_id = %file_id,
                    references,
                    "Removed references created against a failed reservation"
                );
            }
            Err(e) => {
                tracing::error!(
                    file_id = %file_id,
                    error = %e,
                    "Compensating delete failed, reservation left behind"
                );
            }
        }
    }

    /// Best-effort bookkeeping after a successful blob write.
    async fn finalize(&self, user_id: &str, file_id: FileId, file_hash: &str) {
        match self.metadata.mark_ready(file_id).await {
            Ok(()) => {}
            Err(MetadataError::NotFound(_)) => {
                // The owner deleted the record while the blob was in flight.
                // If nothing references it, the delete's purge ran before our
                // write landed.
                tracing::warn!(file_id = %file_id, "Original deleted before it became ready");
                match self.metadata.count_references(file_id).await {
                    Ok(0) => self.remove_blob_quietly(&file_id.blob_key()).await,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(file_id = %file_id, error = %e, "Failed to count references");
                    }
                }
                return;
            }
            Err(e) => {
                tracing::warn!(file_id = %file_id, error = %e, "Failed to mark original ready");
            }
        }

        let chunk = ChunkRow {
            user_id: user_id.to_string(),
            file_id: file_id.get(),
            chunk_hash: file_hash.to_string(),
            chunk_index: WHOLE_FILE_CHUNK_INDEX,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.metadata.insert_chunk(&chunk).await {
            tracing::warn!(file_id = %file_id, error = %e, "Failed to record chunk");
        }
    }

    /// Delete a record owned by `user_id`.
    #[tracing::instrument(skip(self), fields(file_id = %file_id))]
    pub async fn delete(&self, user_id: &str, file_id: FileId) -> DedupResult<DeleteOutcome> {
        if user_id.trim().is_empty() {
            return Err(DedupError::Validation("user_id is required".to_string()));
        }

        let result = self.delete_record(user_id, file_id).await;
        match &result {
            Ok(outcome) => metrics::record_delete(outcome),
            Err(e) => metrics::record_delete_failure(e.kind()),
        }
        result
    }

    async fn delete_record(&self, user_id: &str, file_id: FileId) -> DedupResult<DeleteOutcome> {
        let record = self
            .metadata
            .get_user_file(file_id, user_id)
            .await?
            .ok_or(DedupError::NotFound)?;

        if record.is_reference() {
            let removal = self
                .metadata
                .delete_reference(file_id, user_id)
                .await
                .map_err(not_found_as_missing)?;
            if removal.blob_orphaned {
                tracing::info!(
                    lineage_id = %removal.lineage_id,
                    "Last reference to deleted original removed, purging content"
                );
                self.purge(removal.lineage_id).await?;
            }
            return Ok(DeleteOutcome::ReferenceRemoved);
        }

        let remaining_references = self
            .metadata
            .delete_original(file_id, user_id)
            .await
            .map_err(not_found_as_missing)?;
        if remaining_references > 0 {
            tracing::info!(remaining_references, "Original removed, content kept for references");
            return Ok(DeleteOutcome::RecordRemoved {
                remaining_references,
            });
        }

        self.purge(file_id).await?;
        Ok(DeleteOutcome::ContentRemoved)
    }

    /// Remove the blob of a lineage with no remaining records, then its chunks.
    async fn purge(&self, lineage_id: FileId) -> DedupResult<()> {
        let key = lineage_id.blob_key();
        match self.storage.delete(&key).await {
            Ok(()) => {}
            // A reservation deleted before its write finished has no blob.
            Err(StorageError::NotFound(_)) => {
                tracing::debug!(lineage_id = %lineage_id, "No blob to purge");
            }
            Err(e) => {
                tracing::error!(
                    lineage_id = %lineage_id,
                    error = %e,
                    "Blob purge failed after metadata removal, object orphaned"
                );
                return Err(e.into());
            }
        }
        metrics::BLOB_PURGES.inc();

        if let Err(e) = self.metadata.delete_chunks_for_file(lineage_id).await {
            tracing::warn!(lineage_id = %lineage_id, error = %e, "Failed to delete chunk records");
        }
        Ok(())
    }

    async fn remove_blob_quietly(&self, key: &str) {
        match self.storage.delete(key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to remove stray blob"),
        }
    }

    async fn discard_staging(&self, key: &str) {
        match self.storage.delete(key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to remove staging object"),
        }
    }
}

fn validate_owner(user_id: &str, name: &str) -> DedupResult<()> {
    if user_id.trim().is_empty() || name.trim().is_empty() {
        return Err(DedupError::Validation(
            "user_id and name are required".to_string(),
        ));
    }
    Ok(())
}

/// The record vanished between lookup and delete: a concurrent delete won.
fn not_found_as_missing(e: MetadataError) -> DedupError {
    match e {
        MetadataError::NotFound(_) => DedupError::NotFound,
        other => other.into(),
    }
}
