use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Logical file owned by a user, pointing at a blob
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub owner: String,
    pub fingerprint: String,
    pub display_name: String,
    pub media_type: String,
    pub created_at: String,
    pub is_duplicate: bool,
}

/// File response with the size of the content it points at
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FileResponse {
    pub id: String,
    pub owner: String,
    pub fingerprint: String,
    pub display_name: String,
    pub media_type: String,
    pub created_at: String,
    pub is_duplicate: bool,
    pub byte_size: i64,
}

impl FileResponse {
    pub fn new(file: FileRecord, byte_size: i64) -> Self {
        Self {
            id: file.id,
            owner: file.owner,
            fingerprint: file.fingerprint,
            display_name: file.display_name,
            media_type: file.media_type,
            created_at: file.created_at,
            is_duplicate: file.is_duplicate,
            byte_size,
        }
    }
}

/// File list response
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileResponse>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// File list query parameters
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileFilter {
    pub search: Option<String>,
    pub media_type: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

impl FileFilter {
    /// 1-based page number
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

/// Successful upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub request_id: String,
    pub file: FileResponse,
    pub is_duplicate: bool,
}

/// Successful delete
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReceipt {
    pub request_id: String,
    pub purged: bool,
}

/// Storage savings for a user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub owner: String,
    pub total_storage_used: i64,
    pub original_storage_used: i64,
    pub storage_savings: i64,
    pub savings_percentage: f64,
}

impl StorageStats {
    pub fn new(owner: &str, total_storage_used: i64, original_storage_used: i64) -> Self {
        let storage_savings = original_storage_used - total_storage_used;
        let savings_percentage = if original_storage_used > 0 {
            let pct = storage_savings as f64 / original_storage_used as f64 * 100.0;
            (pct * 10.0).round() / 10.0
        } else {
            0.0
        };

        Self {
            owner: owner.to_string(),
            total_storage_used,
            original_storage_used,
            storage_savings,
            savings_percentage,
        }
    }
}
