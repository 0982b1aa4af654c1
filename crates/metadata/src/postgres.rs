//! PostgreSQL-based metadata store implementation.
//!
//! Mutations that change how many records back a blob take a
//! transaction-scoped advisory lock keyed by the lineage's original id.
//! Deletes take it exclusively; reference creation takes it shared, so
//! references can be added concurrently but never while the last
//! remaining record of the lineage is being counted and removed.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{ChunkRow, FileRow, ReferenceRemoval};
use crate::repos::{ChunkRepo, FileRepo};
use crate::store::{FILE_COLUMNS, MetadataStore};
use async_trait::async_trait;
use hoard_core::config::PgSslMode;
use hoard_core::{FileId, FileKind};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, Transaction};
use std::str::FromStr;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Map a PostgreSQL unique violation (SQLSTATE 23505) to `AlreadyExists`.
fn map_unique_violation(e: sqlx::Error, what: impl Into<String>) -> MetadataError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.code().as_deref() == Some("23505")
    {
        return MetadataError::AlreadyExists(what.into());
    }
    e.into()
}

async fn lock_lineage(tx: &mut Transaction<'_, Postgres>, lineage: i64) -> MetadataResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(lineage)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn lock_lineage_shared(
    tx: &mut Transaction<'_, Postgres>,
    lineage: i64,
) -> MetadataResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock_shared($1)")
        .bind(lineage)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// This allows credentials to be passed separately (e.g., the password
    /// via an environment variable).
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold several commands, so run them one by one.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl FileRepo for PostgresStore {
    async fn find_original_by_hash(&self, file_hash: &str) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE file_hash = $1"
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
            WHERE user_id = $1
              AND (file_hash = $2
                   OR parent_file_id = $3
                   OR parent_file_id IN (SELECT file_id FROM chunks WHERE chunk_hash = $2))
            ORDER BY id
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .bind(file_hash)
        .bind(original_id.map(|id| id.get()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_file(&self, file_id: FileId) -> MetadataResult<Option<FileRow>> {
        let row =
            sqlx::query_as::<_, FileRow>(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = $1"))
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
            "SELECT {FILE_COLUMNS} FROM files WHERE id = $1 AND user_id = $2"
        ))
        .bind(file_id.get())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn count_references(&self, original_id: FileId) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE parent_file_id = $1")
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
            INSERT INTO files (name, user_id, type, ready, file_hash, parent_file_id)
            VALUES ($1, $2, $3, FALSE, $4, NULL)
            RETURNING {FILE_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(user_id)
        .bind(FileKind::Regular.as_str())
        .bind(file_hash)
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
        lock_lineage_shared(&mut tx, original_id.get()).await?;

        let original: Option<i64> =
            sqlx::query_scalar("SELECT id FROM files WHERE id = $1 AND parent_file_id IS NULL")
                .bind(original_id.get())
                .fetch_optional(&mut *tx)
                .await?;
        if original.is_none() {
            return Err(MetadataError::NotFound(format!("original {original_id}")));
        }

        let row = sqlx::query_as::<_, FileRow>(&format!(
            r#"
            INSERT INTO files (name, user_id, type, ready, file_hash, parent_file_id)
            VALUES ($1, $2, $3, TRUE, NULL, $4)
            RETURNING {FILE_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(user_id)
        .bind(FileKind::Regular.as_str())
        .bind(original_id.get())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            map_unique_violation(e, format!("reference to {original_id} for user {user_id}"))
        })?;

        tx.commit().await?;
        Ok(row)
    }

    async fn mark_ready(&self, file_id: FileId) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE files SET ready = TRUE WHERE id = $1")
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
        lock_lineage(&mut tx, file_id.get()).await?;

        let references = sqlx::query("DELETE FROM files WHERE parent_file_id = $1")
            .bind(file_id.get())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let removed = sqlx::query("DELETE FROM files WHERE id = $1 AND parent_file_id IS NULL")
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
        let parent: Option<i64> = sqlx::query_scalar(
            "SELECT parent_file_id FROM files WHERE id = $1 AND user_id = $2 AND parent_file_id IS NOT NULL",
        )
        .bind(file_id.get())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(parent) = parent else {
            return Err(MetadataError::NotFound(format!("reference {file_id}")));
        };

        let mut tx = self.pool.begin().await?;
        lock_lineage(&mut tx, parent).await?;

        // Re-check under the lock: a concurrent delete may have won.
        let removed = sqlx::query(
            "DELETE FROM files WHERE id = $1 AND user_id = $2 AND parent_file_id = $3",
        )
        .bind(file_id.get())
        .bind(user_id)
        .bind(parent)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed == 0 {
            return Err(MetadataError::NotFound(format!("reference {file_id}")));
        }

        let survivors: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE id = $1 OR parent_file_id = $1")
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
        lock_lineage(&mut tx, file_id.get()).await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM files WHERE id = $1 AND user_id = $2 AND parent_file_id IS NULL FOR UPDATE",
        )
        .bind(file_id.get())
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(MetadataError::NotFound(format!("original {file_id}")));
        }

        let references: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE parent_file_id = $1")
                .bind(file_id.get())
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(file_id.get())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(references as u64)
    }
}

#[async_trait]
impl ChunkRepo for PostgresStore {
    async fn insert_chunk(&self, chunk: &ChunkRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (user_id, file_id, chunk_hash, chunk_index, created_at)
            VALUES ($1, $2, $3, $4, $5)
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
            FROM chunks WHERE file_id = $1 ORDER BY chunk_index
            "#,
        )
        .bind(file_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_chunks_for_file(&self, file_id: FileId) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE file_id = $1")
            .bind(file_id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
