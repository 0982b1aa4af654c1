//! S3-compatible blob store using the AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::{Bytes, BytesMut};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::instrument;

/// S3 rejects multipart parts smaller than this, except the last one.
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part S3 accepts.
const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Part numbers run from 1 to this.
const MAX_PARTS: u64 = 10_000;

/// Streamed part size doubles after this many parts.
const PARTS_PER_SIZE_STEP: u64 = 500;

/// Largest source a single CopyObject call accepts.
const MAX_COPY_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Preferred range size for multipart copies.
const COPY_PART_SIZE: u64 = 512 * 1024 * 1024;

/// Buffered bytes above this go to a temp file instead of memory.
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_CHECK_KEY: &str = ".hoard-health-check";

const CREDENTIALS_INIT_ERROR_MARKER: &str = "hoard-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "hoard-s3-lazy-credentials-resolve";

/// Builds the AWS default credentials chain on the first signed request
/// rather than at construction time.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|join_err| {
                    CredentialsError::provider_error(format!(
                        "{CREDENTIALS_INIT_ERROR_MARKER}: failed to build AWS credential chain: {join_err}"
                    ))
                })
            })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credentials unavailable: set storage.access_key_id/secret_access_key or provide ambient AWS credentials"
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

fn is_status<E>(err: &SdkError<E>, status: u16) -> bool {
    matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == status)
}

/// Size of streamed part `part_number` (1-based).
///
/// Sizes start at `MIN_PART_SIZE` and double every `PARTS_PER_SIZE_STEP`
/// parts, so an unknown-length stream can reach the 5 TiB object limit
/// within `MAX_PARTS` parts.
fn part_size(part_number: u64) -> u64 {
    let step = (part_number.saturating_sub(1) / PARTS_PER_SIZE_STEP).min(10);
    (MIN_PART_SIZE << step).min(MAX_PART_SIZE)
}

/// Inclusive byte ranges for copying an object of `size` bytes part by part.
fn copy_part_ranges(size: u64) -> Vec<(u64, u64)> {
    let part = COPY_PART_SIZE.max(size.div_ceil(MAX_PARTS));
    (0..size)
        .step_by(part as usize)
        .map(|start| (start, (start + part).min(size) - 1))
        .collect()
}

/// Prepend `http://` to bare `host:port` endpoints.
fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// S3-compatible blob store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects `endpoint/bucket/key` URLs, which MinIO
    /// needs. AWS itself expects virtual-hosted style.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => builder.credentials_provider(
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "hoard-config"),
            ),
            (None, None) => {
                builder.credentials_provider(LazyDefaultCredentialsProvider::new(region.clone()))
            }
            _ => {
                return Err(StorageError::Config(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ));
            }
        };

        let endpoint = endpoint.as_deref().map(normalize_endpoint);
        if let Some(url) = &endpoint {
            builder = builder.endpoint_url(url);
            // Plain-HTTP endpoints get a client that never loads TLS roots.
            if url.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        let prefix = prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix,
            endpoint: endpoint.unwrap_or_else(|| format!("s3.{region}.amazonaws.com")),
        })
    }

    /// Endpoint the client talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// `CopySource` value: `bucket/key` with the key percent-encoded.
    fn copy_source(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(&self.full_key(key), NON_ALPHANUMERIC)
        )
    }

    /// Copy a source too large for CopyObject as ranged `UploadPartCopy` parts.
    async fn multipart_copy(&self, from: &str, to: &str, meta: &ObjectMeta) -> StorageResult<()> {
        let full_key = self.full_key(to);
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .set_content_type(meta.content_type.clone())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return an upload id".to_string()))?
            .to_string();

        let result = async {
            let source = self.copy_source(from);
            let mut parts = Vec::new();
            for (index, (start, end)) in copy_part_ranges(meta.size).into_iter().enumerate() {
                let part_number = index as i32 + 1;
                let output = self
                    .client
                    .upload_part_copy()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .copy_source(&source)
                    .copy_source_range(format!("bytes={start}-{end}"))
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error(e, from))?;
                let e_tag = output
                    .copy_part_result()
                    .and_then(|r| r.e_tag())
                    .unwrap_or_default();
                parts.push(
                    CompletedPart::builder()
                        .e_tag(e_tag)
                        .part_number(part_number)
                        .build(),
                );
            }

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&full_key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            Ok::<(), StorageError>(())
        }
        .await;

        if result.is_err()
            && let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&full_key)
                .upload_id(&upload_id)
                .send()
                .await
        {
            tracing::warn!(key = %to, error = %e, "Failed to abort multipart copy");
        }
        result
    }

    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if is_status(&err, 404) {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_status(&err, 404) => Ok(false),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let last_modified = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(key = %key, timestamp = dt.secs(), error = %e, "Unrepresentable S3 timestamp");
                })
                .ok()
        });

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
            content_type: output.content_type().map(str::to_string),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(data.into_bytes())
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, content_type: Option<&str>) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_content_type(content_type.map(str::to_string))
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn put_stream(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let full_key = self.full_key(key);
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return an upload id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: full_key,
            content_type: content_type.map(str::to_string),
            upload_id,
            parts: Vec::new(),
            bytes_written: 0,
            pending: PendingBytes::default(),
        }))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let meta = self.head(from).await?;
        if meta.size > MAX_COPY_OBJECT_SIZE {
            tracing::debug!(from = %from, to = %to, size = meta.size, "Copying in ranged parts");
            return self.multipart_copy(from, to, &meta).await;
        }

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(self.full_key(to))
            .copy_source(self.copy_source(from))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, from))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // DeleteObject succeeds on missing keys.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        let marker_key = self.full_key(HEALTH_CHECK_KEY);

        let probe = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_status(&e, 404) => Ok(()),
                Err(e) => Err(map_s3_operation_error(e)),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "S3 health check timed out after {}s",
                        HEALTH_CHECK_TIMEOUT.as_secs()
                    ),
                ))
            })?
    }
}

/// Bytes accepted by a multipart upload but not yet sent as a part.
///
/// Small writes accumulate in memory. Once the buffer passes
/// `MAX_BUFFER_SIZE` everything moves to a temp file that is read back
/// one part at a time.
#[derive(Default)]
struct PendingBytes {
    memory: BytesMut,
    spill: Option<SpillFile>,
}

struct SpillFile {
    file: tokio::fs::File,
    written: u64,
    read: u64,
}

impl SpillFile {
    fn unread(&self) -> u64 {
        self.written - self.read
    }

    async fn read_next(&mut self, len: u64) -> StorageResult<Bytes> {
        self.file.seek(std::io::SeekFrom::Start(self.read)).await?;
        let mut buf = Vec::with_capacity(len as usize);
        (&mut self.file).take(len).read_to_end(&mut buf).await?;
        self.read += buf.len() as u64;
        // Writes continue at the end of the file.
        self.file.seek(std::io::SeekFrom::End(0)).await?;
        Ok(Bytes::from(buf))
    }
}

impl PendingBytes {
    async fn push(&mut self, data: &[u8], key: &str) -> StorageResult<()> {
        if let Some(spill) = &mut self.spill {
            spill.file.write_all(data).await?;
            spill.written += data.len() as u64;
            return Ok(());
        }

        self.memory.extend_from_slice(data);
        if self.memory.len() > MAX_BUFFER_SIZE {
            let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
            file.write_all(&self.memory).await?;
            let written = self.memory.len() as u64;
            self.memory = BytesMut::new();
            tracing::debug!(key = %key, spilled = written, "S3 upload buffer spilled to temp file");
            self.spill = Some(SpillFile {
                file,
                written,
                read: 0,
            });
        }
        Ok(())
    }

    /// Take one part of `size` bytes, if enough bytes are pending.
    async fn take_part(&mut self, size: u64) -> StorageResult<Option<Bytes>> {
        match &mut self.spill {
            Some(spill) if spill.unread() >= size => spill.read_next(size).await.map(Some),
            Some(_) => Ok(None),
            None if self.memory.len() as u64 >= size => {
                Ok(Some(self.memory.split_to(size as usize).freeze()))
            }
            None => Ok(None),
        }
    }

    /// Take everything that is left.
    async fn take_rest(&mut self) -> StorageResult<Bytes> {
        match self.spill.take() {
            Some(mut spill) => {
                let unread = spill.unread();
                spill.read_next(unread).await
            }
            None => Ok(std::mem::take(&mut self.memory).freeze()),
        }
    }
}

/// Multipart upload in progress.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    content_type: Option<String>,
    upload_id: String,
    parts: Vec<CompletedPart>,
    bytes_written: u64,
    pending: PendingBytes,
}

impl S3Upload {
    fn next_part_size(&self) -> u64 {
        part_size(self.parts.len() as u64 + 1)
    }

    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let part_number = self.parts.len() as i32 + 1;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        self.parts.push(
            CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn abort_multipart(&self) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;
        self.pending.push(&data, &self.key).await?;
        while let Some(part) = self.pending.take_part(self.next_part_size()).await? {
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        let rest = self.pending.take_rest().await?;
        if !rest.is_empty() {
            self.upload_part(rest).await?;
        }

        // Multipart uploads need at least one non-empty part, so empty
        // objects go through PutObject.
        if self.parts.is_empty() {
            if let Err(e) = self.abort_multipart().await {
                tracing::warn!(key = %self.key, error = %e, "Failed to abort multipart upload for empty object");
            }
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .set_content_type(self.content_type.clone())
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            return Ok(0);
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.abort_multipart().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_backend(prefix: Option<String>) -> S3Backend {
        S3Backend::new(
            "test-bucket",
            Some("s3.test".to_string()),
            Some("us-east-1".to_string()),
            prefix,
            Some("access".to_string()),
            Some("secret".to_string()),
            true,
        )
        .await
        .expect("backend should construct for unit tests")
    }

    #[tokio::test]
    async fn test_full_key_applies_prefix() {
        let backend = make_backend(Some("uploads/".to_string())).await;
        assert_eq!(backend.full_key("42"), "uploads/42");

        let backend = make_backend(None).await;
        assert_eq!(backend.full_key("42"), "42");
    }

    #[tokio::test]
    async fn test_empty_prefix_is_ignored() {
        let backend = make_backend(Some("/".to_string())).await;
        assert_eq!(backend.full_key("7"), "7");
    }

    #[tokio::test]
    async fn test_new_requires_complete_credentials() {
        let err = S3Backend::new(
            "bucket",
            None,
            Some("us-east-1".to_string()),
            None,
            Some("access".to_string()),
            None,
            false,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_new_normalizes_endpoint() {
        let backend = S3Backend::new("bucket", Some("minio:9000".to_string()), None, None, None, None, true)
            .await
            .unwrap();
        assert_eq!(backend.endpoint(), "http://minio:9000");

        let backend = S3Backend::new("bucket", None, Some("eu-west-1".to_string()), None, None, None, false)
            .await
            .unwrap();
        assert_eq!(backend.endpoint(), "s3.eu-west-1.amazonaws.com");
    }

    #[test]
    fn test_normalize_endpoint_keeps_scheme() {
        assert_eq!(normalize_endpoint("HTTPS://s3.example"), "HTTPS://s3.example");
        assert_eq!(normalize_endpoint("localhost:9000"), "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_pending_bytes_memory_parts() {
        let mut pending = PendingBytes::default();
        pending
            .push(&vec![1u8; MIN_PART_SIZE as usize + 10], "k")
            .await
            .unwrap();

        let part = pending.take_part(MIN_PART_SIZE).await.unwrap().unwrap();
        assert_eq!(part.len() as u64, MIN_PART_SIZE);
        assert!(pending.take_part(MIN_PART_SIZE).await.unwrap().is_none());
        assert_eq!(pending.take_rest().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_pending_bytes_spills_and_reads_in_order() {
        let mut pending = PendingBytes::default();
        let mut data = vec![0u8; MAX_BUFFER_SIZE + 1];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        pending.push(&data, "k").await.unwrap();
        assert!(pending.spill.is_some());
        pending.push(b"tail", "k").await.unwrap();

        let mut collected = Vec::new();
        while let Some(part) = pending.take_part(MIN_PART_SIZE).await.unwrap() {
            assert_eq!(part.len() as u64, MIN_PART_SIZE);
            collected.extend_from_slice(&part);
        }
        collected.extend_from_slice(&pending.take_rest().await.unwrap());

        data.extend_from_slice(b"tail");
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn test_pending_bytes_takes_requested_part_size() {
        let mut pending = PendingBytes::default();
        pending
            .push(&vec![3u8; 2 * MIN_PART_SIZE as usize], "k")
            .await
            .unwrap();

        assert!(pending.take_part(4 * MIN_PART_SIZE).await.unwrap().is_none());
        let part = pending.take_part(2 * MIN_PART_SIZE).await.unwrap().unwrap();
        assert_eq!(part.len() as u64, 2 * MIN_PART_SIZE);
        assert!(pending.take_rest().await.unwrap().is_empty());
    }

    #[test]
    fn test_part_size_doubles_per_step() {
        assert_eq!(part_size(1), MIN_PART_SIZE);
        assert_eq!(part_size(PARTS_PER_SIZE_STEP), MIN_PART_SIZE);
        assert_eq!(part_size(PARTS_PER_SIZE_STEP + 1), 2 * MIN_PART_SIZE);
        assert_eq!(part_size(3 * PARTS_PER_SIZE_STEP + 1), 8 * MIN_PART_SIZE);
        assert_eq!(part_size(MAX_PARTS), MAX_PART_SIZE);
    }

    #[test]
    fn test_part_sizes_reach_object_limit_within_max_parts() {
        let capacity: u64 = (1..=MAX_PARTS).map(part_size).sum();
        assert!(capacity >= 5 * 1024 * 1024 * 1024 * 1024);

        // The default 100 GiB upload ceiling fits well before the last part.
        let mut total = 0u64;
        let mut parts = 0u64;
        while total < 100 * 1024 * 1024 * 1024 {
            parts += 1;
            total += part_size(parts);
        }
        assert!(parts < MAX_PARTS);
    }

    #[test]
    fn test_copy_part_ranges_cover_source() {
        let size = 6 * 1024 * 1024 * 1024 + 7;
        let ranges = copy_part_ranges(size);

        assert_eq!(ranges.len(), 13);
        assert_eq!(ranges[0], (0, COPY_PART_SIZE - 1));
        assert_eq!(ranges[12], (12 * COPY_PART_SIZE, size - 1));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn test_copy_part_ranges_stay_within_part_limit() {
        let size = 5 * 1024 * 1024 * 1024 * 1024;
        let ranges = copy_part_ranges(size);

        assert!(ranges.len() as u64 <= MAX_PARTS);
        assert_eq!(ranges.last().map(|r| r.1), Some(size - 1));
        assert!(
            ranges
                .iter()
                .all(|(start, end)| end - start + 1 <= MAX_PART_SIZE)
        );
    }

    #[test]
    fn test_copy_object_limit_matches_threshold() {
        assert!(copy_part_ranges(MAX_COPY_OBJECT_SIZE + 1).len() > 1);
        assert!(copy_part_ranges(0).is_empty());
    }
}
