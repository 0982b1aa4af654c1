//! Upload and delete endpoints.

use crate::dedup::{DedupResult, StagedContent, UploadRequest};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use hoard_core::{ContentHash, ContentHasher, DeleteOutcome, FileId, UploadKind};
use hoard_storage::StreamingUpload;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Content type recorded when the file part does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Key prefix for objects spooled while a large part is hashed.
pub const STAGING_PREFIX: &str = "staging";

/// Upload response.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub file_id: FileId,
}

/// Delete response.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
}

/// Query parameters of `DELETE /deleteFile`.
#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub user_id: Option<String>,
    pub file_id: Option<String>,
}

/// The file part, either buffered or spooled to a staging object.
enum FilePart {
    Memory { data: Bytes, content_type: String },
    Staged(StagedContent),
}

#[derive(Default)]
struct UploadForm {
    user_id: Option<String>,
    name: Option<String>,
    file: Option<FilePart>,
}

/// Staging object being written while the part streams in.
struct Spool {
    key: String,
    upload: Box<dyn StreamingUpload>,
}

/// POST /uploadFile - multipart `user_id`, `name`, `file`.
#[tracing::instrument(skip(state, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let mut form = UploadForm::default();
    if let Err(e) = read_form(&state, &mut multipart, &mut form).await {
        if let Some(FilePart::Staged(staged)) = form.file {
            discard_staging(&state, &staged.key).await;
        }
        return Err(e);
    }

    let user_id = form.user_id.unwrap_or_default();
    let name = form.name.unwrap_or_default();
    let part = form
        .file
        .ok_or_else(|| ApiError::BadRequest("file is required".to_string()))?;

    let coordinator = state.coordinator.clone();
    let outcome = match part {
        FilePart::Memory { data, content_type } => {
            if user_id.trim().is_empty() || name.trim().is_empty() {
                return Err(ApiError::BadRequest(
                    "user_id and name are required".to_string(),
                ));
            }
            let request = UploadRequest {
                user_id,
                name,
                content_type: Some(content_type),
                content: data,
            };
            run_detached(move |cancel| async move { coordinator.upload(request, cancel).await })
                .await?
        }
        // The coordinator validates and always removes the staging object.
        FilePart::Staged(staged) => {
            run_detached(move |cancel| async move {
                coordinator
                    .upload_staged(&user_id, &name, staged, cancel)
                    .await
            })
            .await?
        }
    };

    let status = if outcome.created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let message = match outcome.kind {
        UploadKind::AlreadyUploaded => "Already uploaded",
        UploadKind::Reference => "Duplicate reference created",
        UploadKind::Stored => "File uploaded",
    };
    Ok((
        status,
        Json(UploadResponse {
            message,
            file_id: outcome.file_id,
        }),
    ))
}

/// DELETE /deleteFile?user_id=..&file_id=..
#[tracing::instrument(skip(state))]
pub async fn delete_file(
    State(state): State<AppState>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<DeleteResponse>> {
    let user_id = params
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("user_id is required".to_string()))?;
    let file_id: FileId = params
        .file_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("file_id is required".to_string()))?
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid file_id: {e}")))?;

    let coordinator = state.coordinator.clone();
    let outcome =
        run_detached(move |_| async move { coordinator.delete(&user_id, file_id).await }).await?;

    let message = match outcome {
        DeleteOutcome::ReferenceRemoved => "Reference deleted".to_string(),
        DeleteOutcome::RecordRemoved {
            remaining_references,
        } => format!(
            "Record deleted; {remaining_references} references remain, keeping content."
        ),
        DeleteOutcome::ContentRemoved => "File and chunks deleted".to_string(),
    };
    Ok(Json(DeleteResponse { message }))
}

/// Run a coordinator operation on its own task.
///
/// If the client goes away the handler future is dropped, which cancels
/// the token; the task keeps running so compensation can finish.
async fn run_detached<T, F, Fut>(op: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = DedupResult<T>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let task = tokio::spawn(op(cancel));
    let result = task
        .await
        .map_err(|e| ApiError::Internal(format!("coordinator task failed: {e}")))?;
    Ok(result?)
}

async fn read_form(
    state: &AppState,
    multipart: &mut Multipart,
    form: &mut UploadForm,
) -> ApiResult<()> {
    let limit = state.config.server.max_upload_size;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::from_multipart(e, limit))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("user_id") => {
                form.user_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::from_multipart(e, limit))?,
                );
            }
            Some("name") => {
                form.name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::from_multipart(e, limit))?,
                );
            }
            Some("file") => {
                if form.file.is_some() {
                    return Err(ApiError::BadRequest(
                        "only one file part is accepted".to_string(),
                    ));
                }
                form.file = Some(read_file(state, field).await?);
            }
            other => {
                tracing::debug!(field = ?other, "Ignoring unknown multipart field");
            }
        }
    }
    Ok(())
}

/// Read the file part, hashing as it arrives. Parts larger than the memory
/// threshold continue into a staging object.
async fn read_file(state: &AppState, mut field: Field<'_>) -> ApiResult<FilePart> {
    let content_type = field
        .content_type()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let mut hasher = ContentHash::hasher();
    let mut buffer = BytesMut::new();
    let mut spool: Option<Spool> = None;

    let pumped = pump(
        state,
        &mut field,
        &content_type,
        &mut hasher,
        &mut buffer,
        &mut spool,
    )
    .await;
    if let Err(e) = pumped {
        if let Some(spool) = spool
            && let Err(abort_err) = spool.upload.abort().await
        {
            tracing::warn!(key = %spool.key, error = %abort_err, "Failed to abort staging upload");
        }
        return Err(e);
    }

    let hash = hasher.finalize();
    match spool {
        None => Ok(FilePart::Memory {
            data: buffer.freeze(),
            content_type,
        }),
        Some(Spool { key, upload }) => {
            let size = upload.finish().await?;
            tracing::debug!(key = %key, size, "Spooled large part to staging");
            Ok(FilePart::Staged(StagedContent { key, hash, size }))
        }
    }
}

async fn pump(
    state: &AppState,
    field: &mut Field<'_>,
    content_type: &str,
    hasher: &mut ContentHasher,
    buffer: &mut BytesMut,
    spool: &mut Option<Spool>,
) -> ApiResult<()> {
    let limit = state.config.server.max_upload_size;
    let threshold = state.max_memory_buffer();

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::from_multipart(e, limit))?
    {
        hasher.update(&chunk);
        if let Some(spool) = spool.as_mut() {
            spool.upload.write(chunk).await?;
            continue;
        }

        buffer.extend_from_slice(&chunk);
        if buffer.len() > threshold {
            let key = format!("{STAGING_PREFIX}/{}", Uuid::new_v4());
            let upload = state.storage.put_stream(&key, Some(content_type)).await?;
            let staged = spool.insert(Spool { key, upload });
            staged.upload.write(buffer.split().freeze()).await?;
        }
    }
    Ok(())
}

async fn discard_staging(state: &AppState, key: &str) {
    if let Err(e) = state.storage.delete(key).await
        && !e.is_not_found()
    {
        tracing::warn!(key = %key, error = %e, "Failed to remove staging object");
    }
}
