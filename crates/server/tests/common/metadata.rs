//! Metadata store test utilities.

use async_trait::async_trait;
use hoard_core::FileId;
use hoard_metadata::repos::{ChunkRepo, FileRepo};
use hoard_metadata::{
    ChunkRow, FileRow, MetadataError, MetadataResult, MetadataStore, PostgresStore,
    ReferenceRemoval, SqliteStore,
};
use sqlx::{Pool, Postgres as SqlxPostgres, Sqlite};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A test metadata store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestMetadata {
    /// Create a new test metadata store backed by a temporary SQLite file.
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, 5).await?;
        let arc_store = Arc::new(store);

        Ok(Self {
            store: arc_store.clone(),
            sqlite_store: arc_store,
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}

/// PostgreSQL test metadata store wrapper that manages a testcontainer.
#[allow(dead_code)]
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) postgres_store: Arc<PostgresStore>,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl PostgresTestMetadata {
    /// Create a new PostgreSQL test store with a testcontainer.
    pub async fn new() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        let store = PostgresStore::from_url(&url, 5, Some(30_000)).await?;
        let arc_store = Arc::new(store);

        Ok(Self {
            store: arc_store.clone(),
            postgres_store: arc_store,
            _container: container,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Get a reference to the PostgreSQL connection pool for raw queries.
    pub fn pool(&self) -> &Pool<SqlxPostgres> {
        self.postgres_store.pool()
    }
}

/// Try to create a PostgreSQL test store, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures cause a skip. Schema, migration, or
/// connection errors still panic so real regressions are not swallowed.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<PostgresTestMetadata> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestMetadata::new().await {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

/// Metadata store whose fingerprint reservation always loses the race, as
/// if another uploader kept claiming the hash and vanishing again.
#[allow(dead_code)]
pub struct ContendedMetadata {
    inner: Arc<dyn MetadataStore>,
    reservations: AtomicUsize,
}

#[allow(dead_code)]
impl ContendedMetadata {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reservations: AtomicUsize::new(0),
        })
    }

    /// Number of reservation attempts seen.
    pub fn reservations(&self) -> usize {
        self.reservations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for ContendedMetadata {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }
}

#[async_trait]
impl FileRepo for ContendedMetadata {
    async fn find_original_by_hash(&self, file_hash: &str) -> MetadataResult<Option<FileRow>> {
        self.inner.find_original_by_hash(file_hash).await
    }

    async fn find_user_record(
        &self,
        user_id: &str,
        file_hash: &str,
        original_id: Option<FileId>,
    ) -> MetadataResult<Option<FileRow>> {
        self.inner
            .find_user_record(user_id, file_hash, original_id)
            .await
    }

    async fn get_file(&self, file_id: FileId) -> MetadataResult<Option<FileRow>> {
        self.inner.get_file(file_id).await
    }

    async fn get_user_file(
        &self,
        file_id: FileId,
        user_id: &str,
    ) -> MetadataResult<Option<FileRow>> {
        self.inner.get_user_file(file_id, user_id).await
    }

    async fn count_references(&self, original_id: FileId) -> MetadataResult<u64> {
        self.inner.count_references(original_id).await
    }

    async fn reserve_original(
        &self,
        _user_id: &str,
        _name: &str,
        file_hash: &str,
    ) -> MetadataResult<FileRow> {
        self.reservations.fetch_add(1, Ordering::SeqCst);
        Err(MetadataError::AlreadyExists(format!(
            "original with file_hash {file_hash}"
        )))
    }

    async fn create_reference(
        &self,
        user_id: &str,
        name: &str,
        original_id: FileId,
    ) -> MetadataResult<FileRow> {
        self.inner
            .create_reference(user_id, name, original_id)
            .await
    }

    async fn mark_ready(&self, file_id: FileId) -> MetadataResult<()> {
        self.inner.mark_ready(file_id).await
    }

    async fn delete_reservation(&self, file_id: FileId) -> MetadataResult<u64> {
        self.inner.delete_reservation(file_id).await
    }

    async fn delete_reference(
        &self,
        file_id: FileId,
        user_id: &str,
    ) -> MetadataResult<ReferenceRemoval> {
        self.inner.delete_reference(file_id, user_id).await
    }

    async fn delete_original(&self, file_id: FileId, user_id: &str) -> MetadataResult<u64> {
        self.inner.delete_original(file_id, user_id).await
    }
}

#[async_trait]
impl ChunkRepo for ContendedMetadata {
    async fn insert_chunk(&self, chunk: &ChunkRow) -> MetadataResult<()> {
        self.inner.insert_chunk(chunk).await
    }

    async fn get_chunks_for_file(&self, file_id: FileId) -> MetadataResult<Vec<ChunkRow>> {
        self.inner.get_chunks_for_file(file_id).await
    }

    async fn delete_chunks_for_file(&self, file_id: FileId) -> MetadataResult<u64> {
        self.inner.delete_chunks_for_file(file_id).await
    }
}
