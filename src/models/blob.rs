use serde::Serialize;
use sqlx::FromRow;

/// Stored content record - one row per distinct (owner, fingerprint)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlobRecord {
    pub owner: String,
    pub fingerprint: String,
    pub backing_location: String,
    pub byte_size: i64,
    pub reference_count: i64,
    pub created_at: String,
}

/// Outcome of dropping one reference from a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Other files still reference the blob
    Retained { reference_count: i64 },
    /// Last reference dropped; the record is gone and the bytes were scheduled for deletion
    Purged { backing_location: String },
}

impl DeletionOutcome {
    pub fn is_purged(&self) -> bool {
        matches!(self, DeletionOutcome::Purged { .. })
    }
}

/// Backing bytes whose deletion failed after their record was purged
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OrphanedBlob {
    pub backing_location: String,
    pub reason: String,
    pub recorded_at: String,
}
