//! Storage test utilities.

use async_trait::async_trait;
use bytes::Bytes;
use hoard_storage::{
    FilesystemBackend, ObjectMeta, ObjectStore, StorageError, StorageResult, StreamingUpload,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::sync::Notify;

/// A test storage wrapper that cleans up on drop.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestStorage {
    pub backend: Arc<FilesystemBackend>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestStorage {
    /// Create a new test storage with a temporary directory.
    pub async fn new() -> StorageResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let backend = FilesystemBackend::new(temp_dir.path()).await?;

        Ok(Self {
            backend: Arc::new(backend),
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the object store.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.backend.clone()
    }

    /// Number of files left under `staging/`.
    pub fn staging_entries(&self) -> usize {
        match std::fs::read_dir(self.backend.root().join("staging")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

/// Object store wrapper with switchable failures for the blob-write and
/// purge paths.
#[allow(dead_code)]
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    fail_puts: AtomicBool,
    fail_copies: AtomicBool,
    fail_deletes: AtomicBool,
    hold_puts: AtomicBool,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    put_started: Notify,
    release: Notify,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_puts: AtomicBool::new(false),
            fail_copies: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            hold_puts: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            put_started: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_copies(&self, fail: bool) {
        self.fail_copies.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Park every `put` until [`FaultyStore::release_put`] is called.
    pub fn hold_puts(&self, hold: bool) {
        self.hold_puts.store(hold, Ordering::SeqCst);
    }

    /// Let one parked `put` continue.
    pub fn release_put(&self) {
        self.release.notify_one();
    }

    /// Resolve once a `put` has started.
    pub async fn put_started(&self) {
        self.put_started.notified().await;
    }

    /// Number of `put` calls seen.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls seen.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

fn injected(op: &str) -> StorageError {
    StorageError::Io(std::io::Error::other(format!("injected {op} failure")))
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes, content_type: Option<&str>) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.put_started.notify_one();
        if self.hold_puts.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(injected("put"));
        }
        self.inner.put(key, data, content_type).await
    }

    async fn put_stream(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key, content_type).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        if self.fail_copies.load(Ordering::SeqCst) {
            return Err(injected("copy"));
        }
        self.inner.copy(from, to).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected("delete"));
        }
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}
