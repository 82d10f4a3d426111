use axum::{
    body::Body,
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Extension,
};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ApiResponse, AppError, Result, REQUEST_ID_HEADER};
use crate::handlers::with_request_id;
use crate::middleware::Owner;
use crate::models::FileFilter;
use crate::services::{FileService, UploadBody};
use crate::AppState;

/// List files
/// GET /api/v1/files?search=&media_type=&min_size=&max_size=&start_date=&end_date=&page=&page_size=
pub async fn list_files(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Query(filter): Query<FileFilter>,
) -> Result<Response> {
    let request_id = state.limiter.check(owner.as_str())?;
    let files = FileService::list_files(&state.db, owner.as_str(), &filter).await?;
    Ok(with_request_id(&request_id, StatusCode::OK, ApiResponse::success(files)))
}

/// Get a specific file
/// GET /api/v1/files/:id
pub async fn get_file(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Response> {
    let request_id = state.limiter.check(owner.as_str())?;
    let file = FileService::get_file(&state.db, owner.as_str(), &id).await?;
    Ok(with_request_id(&request_id, StatusCode::OK, ApiResponse::success(file)))
}

/// Room for multipart boundaries and part headers on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Request body cap for uploads. Nothing larger than the quota can ever be admitted.
pub fn upload_body_limit(quota_bytes: i64) -> usize {
    usize::try_from(quota_bytes.max(0))
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES)
}

fn multipart_error(context: &str, e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(format!("{}: {}", context, e.body_text()))
    } else {
        AppError::BadRequest(format!("{}: {}", context, e.body_text()))
    }
}

/// Upload a file
/// POST /api/v1/files (multipart, field `file`)
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    mut multipart: Multipart,
) -> Result<Response> {
    // Admit the call before any of the body is read
    let request_id = state.limiter.check(owner.as_str())?;

    let mut temp_file_path: Option<PathBuf> = None;
    let mut file_name: Option<String> = None;
    let mut content_type: Option<String> = None;

    // Process multipart fields
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("Failed to process multipart", e))?
    {
        if field.name() != Some("file") {
            continue;
        }

        file_name = field.file_name().map(|s| s.to_string());
        content_type = field.content_type().map(|s| s.to_string());

        // Spool to a temp file so the upload is never held in memory
        let temp_path = state
            .config
            .storage
            .upload_temp_dir()
            .join(format!("filevault_upload_{}", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&temp_path).await.map_err(|e| {
            AppError::Internal(format!("Failed to create temp file: {}", e))
        })?;
        temp_file_path = Some(temp_path.clone());

        let spooled = async {
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| multipart_error("Failed to read file chunk", e))?
            {
                file.write_all(&chunk).await.map_err(|e| {
                    AppError::Internal(format!("Failed to write to temp file: {}", e))
                })?;
            }
            file.flush().await.map_err(|e| {
                AppError::Internal(format!("Failed to flush temp file: {}", e))
            })
        }
        .await;

        if let Err(e) = spooled {
            remove_temp_file(&temp_path).await;
            return Err(e);
        }
        break;
    }

    let temp_path =
        temp_file_path.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;

    let result = async {
        let file_name =
            file_name.ok_or_else(|| AppError::BadRequest("No file name provided".to_string()))?;
        state
            .pipeline
            .upload_admitted(
                request_id,
                owner.as_str(),
                UploadBody::Spooled(&temp_path),
                &file_name,
                content_type.as_deref(),
            )
            .await
    }
    .await;

    remove_temp_file(&temp_path).await;

    let receipt = result?;
    let request_id = receipt.request_id.clone();
    Ok(with_request_id(&request_id, StatusCode::CREATED, ApiResponse::success(receipt)))
}

async fn remove_temp_file(temp_path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        tracing::error!("Failed to remove temp file {:?}: {}", temp_path, e);
    }
}

/// Download a file
/// GET /api/v1/files/:id/download
pub async fn download_file(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Response> {
    let request_id = state.limiter.check(owner.as_str())?;
    let (file, data) =
        FileService::download(&state.db, state.pipeline.ledger(), owner.as_str(), &id).await?;

    let fallback_name = file.display_name.replace(['"', '\\'], "_");
    let encoded_name = urlencoding::encode(&file.display_name);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &file.media_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        )
        .header(REQUEST_ID_HEADER, &request_id)
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))?;

    Ok(response)
}

/// Delete a file
/// DELETE /api/v1/files/:id
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Response> {
    let receipt = state.pipeline.delete(owner.as_str(), &id).await?;
    let request_id = receipt.request_id.clone();
    Ok(with_request_id(&request_id, StatusCode::OK, ApiResponse::success(receipt)))
}

/// Deduplication savings
/// GET /api/v1/files/storage_stats
pub async fn storage_stats(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
) -> Result<Response> {
    let request_id = state.limiter.check(owner.as_str())?;
    let stats = state.quota.storage_stats(owner.as_str()).await?;
    Ok(with_request_id(&request_id, StatusCode::OK, ApiResponse::success(stats)))
}

/// Distinct media types
/// GET /api/v1/files/file_types
pub async fn file_types(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
) -> Result<Response> {
    let request_id = state.limiter.check(owner.as_str())?;
    let types = FileService::file_types(&state.db, owner.as_str()).await?;
    Ok(with_request_id(&request_id, StatusCode::OK, ApiResponse::success(types)))
}
