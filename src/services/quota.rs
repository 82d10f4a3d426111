use sqlx::SqliteConnection;

use crate::db::Database;
use crate::error::{Result, STORAGE_QUOTA_EXCEEDED};
use crate::models::{Admission, QuotaView, StorageStats};

/// Deduplicated usage: each blob an owner's files point at counts once
const USAGE_SQL: &str = r#"
    SELECT COALESCE(SUM(b.byte_size), 0)
    FROM blobs b
    WHERE b.owner = ?
      AND EXISTS (
          SELECT 1 FROM files f
          WHERE f.owner = b.owner AND f.fingerprint = b.fingerprint
      )
"#;

/// Usage as if every file stored its own copy
const ORIGINAL_USAGE_SQL: &str = r#"
    SELECT COALESCE(SUM(b.byte_size), 0)
    FROM files f
    JOIN blobs b ON b.owner = f.owner AND b.fingerprint = f.fingerprint
    WHERE f.owner = ?
"#;

/// Per-user storage quota
#[derive(Clone)]
pub struct QuotaAccountant {
    db: Database,
    limit_bytes: i64,
}

impl QuotaAccountant {
    pub fn new(db: Database, limit_bytes: i64) -> Self {
        Self {
            db,
            limit_bytes: limit_bytes.max(0),
        }
    }

    pub fn limit_bytes(&self) -> i64 {
        self.limit_bytes
    }

    /// Bytes of distinct content referenced by the owner's files
    pub async fn usage(&self, owner: &str) -> Result<i64> {
        let mut conn = self.db.pool().acquire().await?;
        Self::usage_in(&mut conn, owner).await
    }

    pub async fn usage_in(conn: &mut SqliteConnection, owner: &str) -> Result<i64> {
        let used: i64 = sqlx::query_scalar(USAGE_SQL)
            .bind(owner)
            .fetch_one(&mut *conn)
            .await?;
        Ok(used)
    }

    /// Decide whether `additional_bytes` of new content fits. The limit is inclusive.
    pub async fn admit(&self, owner: &str, additional_bytes: i64) -> Result<Admission> {
        let usage = self.usage(owner).await?;
        Ok(self.decide(usage, additional_bytes))
    }

    /// Same as `admit`, evaluated inside the caller's write transaction
    pub async fn admit_in(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        additional_bytes: i64,
    ) -> Result<Admission> {
        let usage = Self::usage_in(conn, owner).await?;
        Ok(self.decide(usage, additional_bytes))
    }

    fn decide(&self, usage: i64, additional_bytes: i64) -> Admission {
        if usage.saturating_add(additional_bytes) > self.limit_bytes {
            Admission::Denied {
                reason: STORAGE_QUOTA_EXCEEDED.to_string(),
                current_usage_bytes: usage,
                limit_bytes: self.limit_bytes,
                attempted_upload_bytes: additional_bytes,
            }
        } else {
            Admission::Allowed
        }
    }

    pub async fn quota_view(&self, owner: &str) -> Result<QuotaView> {
        let usage = self.usage(owner).await?;
        Ok(QuotaView::new(owner, usage, self.limit_bytes))
    }

    /// Deduplicated usage against what the files would take without dedup
    pub async fn storage_stats(&self, owner: &str) -> Result<StorageStats> {
        let mut conn = self.db.pool().acquire().await?;
        let total = Self::usage_in(&mut conn, owner).await?;
        let original: i64 = sqlx::query_scalar(ORIGINAL_USAGE_SQL)
            .bind(owner)
            .fetch_one(&mut *conn)
            .await?;
        Ok(StorageStats::new(owner, total, original))
    }
}
