//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Key/value blob store.
///
/// Writes are not transactional: callers that pair a blob with metadata
/// must compensate for partial failures themselves.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get object metadata. `NotFound` if missing.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Read a whole object. `NotFound` if missing.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Write a whole object, replacing any existing one.
    async fn put(&self, key: &str, data: Bytes, content_type: Option<&str>) -> StorageResult<()>;

    /// Start a streaming write. Nothing is visible under `key` until
    /// [`StreamingUpload::finish`] succeeds.
    async fn put_stream(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Copy an object within the store.
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Remove an object. `NotFound` if missing.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Short backend identifier for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable. Called once at startup.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Object metadata.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the backend reports one.
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type recorded at write time, when the backend keeps one.
    pub content_type: Option<String>,
}

/// An in-progress streaming write.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Append data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Commit the object and return the number of bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
