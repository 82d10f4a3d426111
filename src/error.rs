use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::models::RateLimitInfo;

/// Response header echoing the request id minted by the rate limiter
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Message returned when a user exceeds the call limit
pub const CALL_LIMIT_REACHED: &str = "Call Limit Reached";
/// Message returned when new content would exceed the storage quota
pub const STORAGE_QUOTA_EXCEEDED: &str = "Storage Quota Exceeded";

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Call Limit Reached")]
    RateLimited {
        request_id: String,
        info: RateLimitInfo,
    },

    #[error("Storage Quota Exceeded: {current_usage_bytes} + {attempted_upload_bytes} > {limit_bytes}")]
    QuotaExceeded {
        current_usage_bytes: i64,
        limit_bytes: i64,
        attempted_upload_bytes: i64,
    },

    #[error("Storage write failed: {0}")]
    StorageWriteFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for sqlx unique-key violations
    pub fn is_unique_violation(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }
}

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: &str) -> ApiResponse<()> {
        ApiResponse {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn error_with(code: i32, message: &str, data: T) -> Self {
        Self {
            code,
            message: message.to_string(),
            data: Some(data),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, 500, "Database error".to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, 404, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, 400, msg.clone()),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, 413, msg.clone()),
            AppError::RateLimited { request_id, info } => {
                let body = Json(ApiResponse::error_with(
                    429,
                    CALL_LIMIT_REACHED,
                    json!({ "request_id": request_id, "rate_limit_info": info }),
                ));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                if let Ok(value) = HeaderValue::from_str(request_id) {
                    response.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                return response;
            }
            AppError::QuotaExceeded {
                current_usage_bytes,
                limit_bytes,
                attempted_upload_bytes,
            } => {
                let body = Json(ApiResponse::error_with(
                    429,
                    STORAGE_QUOTA_EXCEEDED,
                    json!({
                        "current_usage_bytes": current_usage_bytes,
                        "limit_bytes": limit_bytes,
                        "attempted_upload_bytes": attempted_upload_bytes,
                    }),
                ));
                return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            }
            AppError::StorageWriteFailed(msg) => {
                tracing::error!("Storage write failed: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    500,
                    format!("Failed to upload to storage: {}", msg),
                )
            }
            AppError::Storage(msg) => {
                tracing::error!("Storage error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, 500, msg.clone())
            }
            AppError::Io(e) => {
                tracing::warn!("IO error: {:?}", e);
                (
                    StatusCode::BAD_REQUEST,
                    400,
                    format!("Failed to read file content: {}", e),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, 500, msg.clone())
            }
        };

        let body = Json(ApiResponse::<()>::error(code, &message));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
