//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{ChunkRow, FileRow, ReferenceRemoval};
use crate::repos::{ChunkRepo, FileRepo};
use async_trait::async_trait;
use hoard_core::{FileId, FileKind};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: FileRepo + ChunkRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// Columns selected for every `FileRow` query.
pub(crate) const FILE_COLUMNS: &str =
    "id, name, user_id, type, ready, file_hash, parent_file_id, created_at";

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite database at `path`.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: u64) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            // One connection serializes every transaction, which is what makes
            // the count-then-delete and check-then-insert paths atomic here.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::info!(path = %path.display(), "SQLite metadata store ready");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Map a SQLite unique violation to `AlreadyExists`, leaving other errors alone.
fn map_unique_violation(e: sqlx::Error, what: impl Into<String>) -> MetadataError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.message().contains("UNIQUE constraint")
    {
        return MetadataError::AlreadyExists(what.into());
    }
    e.into()
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl FileRepo for SqliteStore {
    async fn find_original_by_hash(&self, file_hash: &str) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE file_hash = ?"
        ))
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_user_record(
        &self,
        user_id: &str,
        file_hash: &str,
        original_id: Option<FileId>,
    ) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            r#"
            SELECT {FILE_COLUMNS} FROM files
            WHERE user_id = ?
              AND (file_hash = ?
                   OR parent_file_id = ?
                   OR parent_file_id IN (SELECT file_id FROM chunks WHERE chunk_hash = ?))
            ORDER BY id
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .bind(file_hash)
        .bind(original_id.map(|id| id.get()))
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_file(&self, file_id: FileId) -> MetadataResult<Option<FileRow>> {
        let row =
            sqlx::query_as::<_, FileRow>(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?"))
                .bind(file_id.get())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn get_user_file(
        &self,
        file_id: FileId,
        user_id: &str,
    ) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ? AND user_id = ?"
        ))
        .bind(file_id.get())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn count_references(&self, original_id: FileId) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE parent_file_id = ?")
            .bind(original_id.get())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn reserve_original(
        &self,
        user_id: &str,
        name: &str,
        file_hash: &str,
    ) -> MetadataResult<FileRow> {
        sqlx::query_as::<_, FileRow>(&format!(
            r#"
            INSERT INTO files (name, user_id, type, ready, file_hash, parent_file_id, created_at)
            VALUES (?, ?, ?, 0, ?, NULL, ?)
            RETURNING {FILE_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(user_id)
        .bind(FileKind::Regular.as_str())
        .bind(file_hash)
        .bind(OffsetDateTime::now_utc())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, format!("original with file_hash {file_hash}")))
    }

    async fn create_reference(
        &self,
        user_id: &str,
        name: &str,
        original_id: FileId,
    ) -> MetadataResult<FileRow> {
        let mut tx = self.pool.begin().await?;

        let original: Option<i64> =
            sqlx::query_scalar("SELECT id FROM files WHERE id = ? AND parent_file_id IS NULL")
                .bind(original_id.get())
                .fetch_optional(&mut *tx)
                .await?;
        if original.is_none() {
            return Err(MetadataError::NotFound(format!("original {original_id}")));
        }

        let row = sqlx::query_as::<_, FileRow>(&format!(
            r#"
            INSERT INTO files (name, user_id, type, ready, file_hash, parent_file_id, created_at)
            VALUES (?, ?, ?, 1, NULL, ?, ?)
            RETURNING {FILE_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(user_id)
        .bind(FileKind::Regular.as_str())
        .bind(original_id.get())
        .bind(OffsetDateTime::now_utc())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            map_unique_violation(e, format!("reference to {original_id} for user {user_id}"))
        })?;

        tx.commit().await?;
        Ok(row)
    }

    async fn mark_ready(&self, file_id: FileId) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE files SET ready = 1 WHERE id = ?")
            .bind(file_id.get())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("file {file_id}")));
        }
        Ok(())
    }

    async fn delete_reservation(&self, file_id: FileId) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;

        let references = sqlx::query("DELETE FROM files WHERE parent_file_id = ?")
            .bind(file_id.get())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let removed = sqlx::query("DELETE FROM files WHERE id = ? AND parent_file_id IS NULL")
            .bind(file_id.get())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(MetadataError::NotFound(format!("reservation {file_id}")));
        }

        tx.commit().await?;
        Ok(references)
    }

    async fn delete_reference(
        &self,
        file_id: FileId,
        user_id: &str,
    ) -> MetadataResult<ReferenceRemoval> {
        let mut tx = self.pool.begin().await?;

        let parent: Option<i64> = sqlx::query_scalar(
            "SELECT parent_file_id FROM files WHERE id = ? AND user_id = ? AND parent_file_id IS NOT NULL",
        )
        .bind(file_id.get())
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(parent) = parent else {
            return Err(MetadataError::NotFound(format!("reference {file_id}")));
        };

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id.get())
            .execute(&mut *tx)
            .await?;

        let survivors: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE id = ? OR parent_file_id = ?")
                .bind(parent)
                .bind(parent)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(ReferenceRemoval {
            lineage_id: FileId::new(parent),
            blob_orphaned: survivors == 0,
        })
    }

    async fn delete_original(&self, file_id: FileId, user_id: &str) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM files WHERE id = ? AND user_id = ? AND parent_file_id IS NULL",
        )
        .bind(file_id.get())
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(MetadataError::NotFound(format!("original {file_id}")));
        }

        let references: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE parent_file_id = ?")
                .bind(file_id.get())
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id.get())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(references as u64)
    }
}

#[async_trait]
impl ChunkRepo for SqliteStore {
    async fn insert_chunk(&self, chunk: &ChunkRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (user_id, file_id, chunk_hash, chunk_index, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.user_id)
        .bind(chunk.file_id)
        .bind(&chunk.chunk_hash)
        .bind(chunk.chunk_index)
        .bind(chunk.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(
                e,
                format!("chunk {} of file {}", chunk.chunk_index, chunk.file_id),
            )
        })?;
        Ok(())
    }

    async fn get_chunks_for_file(&self, file_id: FileId) -> MetadataResult<Vec<ChunkRow>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT user_id, file_id, chunk_hash, chunk_index, created_at
            FROM chunks WHERE file_id = ? ORDER BY chunk_index
            "#,
        )
        .bind(file_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_chunks_for_file(&self, file_id: FileId) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// SQL schema for SQLite.
///
/// AUTOINCREMENT keeps ids from being reused: a blob retained for surviving
/// references is still keyed by its deleted original's id.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'FILE',
    ready INTEGER NOT NULL DEFAULT 0,
    file_hash TEXT UNIQUE,
    parent_file_id INTEGER,
    created_at TEXT NOT NULL,
    CHECK ((file_hash IS NULL) <> (parent_file_id IS NULL)),
    UNIQUE (user_id, parent_file_id)
);
CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_file_id);
CREATE INDEX IF NOT EXISTS idx_files_user ON files(user_id);

CREATE TABLE IF NOT EXISTS chunks (
    user_id TEXT NOT NULL,
    file_id INTEGER NOT NULL,
    chunk_hash TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (file_id, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(chunk_hash);
"#;
