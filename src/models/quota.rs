use serde::Serialize;

use crate::error::{AppError, Result};

/// Derived quota state for one owner. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaView {
    pub owner: String,
    pub current_usage_bytes: i64,
    pub limit_bytes: i64,
    pub available_bytes: i64,
    pub usage_percentage: f64,
}

impl QuotaView {
    pub fn new(owner: &str, current_usage_bytes: i64, limit_bytes: i64) -> Self {
        let usage_percentage = if limit_bytes > 0 {
            (current_usage_bytes as f64 / limit_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        Self {
            owner: owner.to_string(),
            current_usage_bytes,
            limit_bytes,
            available_bytes: (limit_bytes - current_usage_bytes).max(0),
            usage_percentage,
        }
    }
}

/// Quota decision for new content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied {
        reason: String,
        current_usage_bytes: i64,
        limit_bytes: i64,
        attempted_upload_bytes: i64,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Turn a denial into `QuotaExceeded`
    pub fn into_result(self) -> Result<()> {
        match self {
            Admission::Allowed => Ok(()),
            Admission::Denied {
                current_usage_bytes,
                limit_bytes,
                attempted_upload_bytes,
                ..
            } => Err(AppError::QuotaExceeded {
                current_usage_bytes,
                limit_bytes,
                attempted_upload_bytes,
            }),
        }
    }
}
