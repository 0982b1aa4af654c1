//! File record repository.

use crate::error::MetadataResult;
use crate::models::{FileRow, ReferenceRemoval};
use async_trait::async_trait;
use hoard_core::FileId;

/// Repository for file records.
///
/// Every mutation that can change how many records back a blob runs in a
/// single store transaction, so concurrent deletes can never both observe
/// a surviving sibling and skip the purge.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Find the original record carrying this fingerprint, ready or not.
    async fn find_original_by_hash(&self, file_hash: &str) -> MetadataResult<Option<FileRow>>;

    /// Find the record `user_id` already holds for this content.
    ///
    /// Matches the user's own original with `file_hash`, a reference to
    /// `original_id`, or a reference into an older lineage of the same
    /// content whose blob is still retained for surviving references.
    /// Pass `None` when no original currently carries the fingerprint.
    async fn find_user_record(
        &self,
        user_id: &str,
        file_hash: &str,
        original_id: Option<FileId>,
    ) -> MetadataResult<Option<FileRow>>;

    /// Get a record by id regardless of owner.
    async fn get_file(&self, file_id: FileId) -> MetadataResult<Option<FileRow>>;

    /// Get a record by id only if `user_id` owns it.
    async fn get_user_file(&self, file_id: FileId, user_id: &str)
    -> MetadataResult<Option<FileRow>>;

    /// Number of reference records pointing at `original_id`.
    async fn count_references(&self, original_id: FileId) -> MetadataResult<u64>;

    /// Reserve a new original (`ready = false`) for `file_hash`.
    ///
    /// Fails with `AlreadyExists` when another original already claims the
    /// fingerprint.
    async fn reserve_original(
        &self,
        user_id: &str,
        name: &str,
        file_hash: &str,
    ) -> MetadataResult<FileRow>;

    /// Create a ready reference to `original_id`.
    ///
    /// Fails with `NotFound` if the original is gone by the time the
    /// transaction runs and with `AlreadyExists` if the user already
    /// references it.
    async fn create_reference(
        &self,
        user_id: &str,
        name: &str,
        original_id: FileId,
    ) -> MetadataResult<FileRow>;

    /// Flag an original as durably stored.
    async fn mark_ready(&self, file_id: FileId) -> MetadataResult<()>;

    /// Compensating delete of a reservation whose blob write failed.
    ///
    /// References created against the reservation while its write was in
    /// flight point at content that never landed, so they are removed in
    /// the same transaction. Returns how many references were removed.
    async fn delete_reservation(&self, file_id: FileId) -> MetadataResult<u64>;

    /// Delete a reference record owned by `user_id`.
    async fn delete_reference(
        &self,
        file_id: FileId,
        user_id: &str,
    ) -> MetadataResult<ReferenceRemoval>;

    /// Delete an original record owned by `user_id`.
    ///
    /// Counts the references to it and deletes it in one transaction;
    /// returns the count observed before the deletion.
    async fn delete_original(&self, file_id: FileId, user_id: &str) -> MetadataResult<u64>;
}
