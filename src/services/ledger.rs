use bytes::Bytes;
use dashmap::DashMap;
use sqlx::SqliteConnection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::db::{self, Database};
use crate::error::{AppError, Result};
use crate::models::{BlobRecord, DeletionOutcome, OrphanedBlob};
use crate::services::ContentHasher;
use crate::storage::BlobStore;

type LedgerKey = (String, String);

/// Reason stored for bytes whose record has not committed yet
const PENDING_REASON: &str = "upload not committed";

/// Content-addressed blob ledger with reference counting.
///
/// Rows are keyed by `(owner, fingerprint)`. Every count change is a single
/// `UPDATE ... RETURNING` statement, and a row whose count reaches zero is deleted
/// in the same transaction, so no reader ever sees a zero count.
///
/// Functions ending in `_in` run on a caller-supplied connection so they can be
/// composed into a larger transaction. Each of them issues its write before any
/// read, which keeps SQLite from having to upgrade a read lock mid-transaction.
pub struct ContentLedger {
    db: Database,
    store: Arc<dyn BlobStore>,
    creating: DashMap<LedgerKey, Arc<Mutex<()>>>,
    writing: DashMap<String, ()>,
}

/// Serializes creation of one `(owner, fingerprint)` within this process
pub struct CreationLock<'a> {
    ledger: &'a ContentLedger,
    key: LedgerKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CreationLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.ledger
            .creating
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

/// Bytes written to the store whose record has not committed yet.
///
/// The location is listed in `orphaned_blobs` from before the write until
/// [`ContentLedger::settle_in`] commits or [`ContentLedger::discard_blob`] runs.
/// While this guard lives, sweeps leave the location alone. Dropping it without
/// either (a cancelled upload) leaves the record for the next sweep.
pub struct PendingBlob<'a> {
    ledger: &'a ContentLedger,
    location: String,
}

impl PendingBlob<'_> {
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl std::fmt::Debug for PendingBlob<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBlob")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingBlob<'_> {
    fn drop(&mut self) {
        self.ledger.writing.remove(&self.location);
    }
}

impl ContentLedger {
    pub fn new(db: Database, store: Arc<dyn BlobStore>) -> Self {
        Self {
            db,
            store,
            creating: DashMap::new(),
            writing: DashMap::new(),
        }
    }

    /// Fresh blob-store key for a fingerprint. Never reused, so a late purge of an
    /// old blob cannot remove bytes written for a newer one.
    pub fn backing_location_for(fingerprint: &str) -> String {
        let prefix = fingerprint.get(..8).unwrap_or(fingerprint);
        format!("files/{}/{}-{}", prefix, fingerprint, Uuid::new_v4().simple())
    }

    // ==================== Lookup ====================

    pub async fn find(&self, owner: &str, fingerprint: &str) -> Result<Option<BlobRecord>> {
        let blob = sqlx::query_as("SELECT * FROM blobs WHERE owner = ? AND fingerprint = ?")
            .bind(owner)
            .bind(fingerprint)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(blob)
    }

    /// Read the bytes behind a record
    pub async fn read(&self, blob: &BlobRecord) -> Result<Bytes> {
        self.store.get(&blob.backing_location).await
    }

    // ==================== Attach ====================

    /// Atomically add one reference. `None` when no record exists.
    pub async fn attach_in(
        conn: &mut SqliteConnection,
        owner: &str,
        fingerprint: &str,
    ) -> Result<Option<BlobRecord>> {
        let blob = sqlx::query_as(
            r#"
            UPDATE blobs SET reference_count = reference_count + 1
            WHERE owner = ? AND fingerprint = ?
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(fingerprint)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(blob)
    }

    pub async fn increment_reference(&self, owner: &str, fingerprint: &str) -> Result<BlobRecord> {
        let mut tx = self.db.pool().begin().await?;
        let blob = Self::attach_in(&mut tx, owner, fingerprint)
            .await?
            .ok_or_else(|| AppError::NotFound("Blob not found".to_string()))?;
        tx.commit().await?;
        Ok(blob)
    }

    // ==================== Create ====================

    /// Take the in-process creation lock for one key
    pub async fn lock_creation(&self, owner: &str, fingerprint: &str) -> CreationLock<'_> {
        let key = (owner.to_string(), fingerprint.to_string());
        let mutex = Arc::clone(self.creating.entry(key.clone()).or_default().value());
        let guard = mutex.lock_owned().await;
        CreationLock {
            ledger: self,
            key,
            guard: Some(guard),
        }
    }

    /// Write bytes to a fresh location. Any store failure becomes `StorageWriteFailed`.
    pub async fn write_blob(&self, fingerprint: &str, data: Bytes) -> Result<PendingBlob<'_>> {
        let pending = self.reserve(fingerprint).await?;
        let written = self.store.put(pending.location(), data).await;
        self.finish_write(fingerprint, pending, written).await
    }

    /// Like [`write_blob`](Self::write_blob), copying from a spooled local file
    pub async fn write_blob_file(
        &self,
        fingerprint: &str,
        local_path: &Path,
    ) -> Result<PendingBlob<'_>> {
        let pending = self.reserve(fingerprint).await?;
        let written = self.store.put_file(pending.location(), local_path).await;
        self.finish_write(fingerprint, pending, written).await
    }

    /// Pick a fresh location and list it as pending before any byte is written
    async fn reserve(&self, fingerprint: &str) -> Result<PendingBlob<'_>> {
        if !ContentHasher::is_fingerprint(fingerprint) {
            return Err(AppError::BadRequest(format!(
                "Invalid content fingerprint: {}",
                fingerprint
            )));
        }

        let location = Self::backing_location_for(fingerprint);
        self.writing.insert(location.clone(), ());
        let pending = PendingBlob {
            ledger: self,
            location,
        };
        self.record_orphan(pending.location(), PENDING_REASON).await?;
        Ok(pending)
    }

    async fn finish_write<'a>(
        &'a self,
        fingerprint: &str,
        pending: PendingBlob<'a>,
        written: Result<()>,
    ) -> Result<PendingBlob<'a>> {
        if let Err(e) = written {
            // A failed write may still have left partial bytes behind
            self.discard_blob(pending).await;
            return Err(match e {
                AppError::StorageWriteFailed(msg) => AppError::StorageWriteFailed(msg),
                other => AppError::StorageWriteFailed(other.to_string()),
            });
        }
        tracing::debug!("Stored blob {} at {}", fingerprint, pending.location());
        Ok(pending)
    }

    /// Mark pending bytes as owned by a record. Runs in the transaction that
    /// inserts the record, so the two commit together.
    pub async fn settle_in(conn: &mut SqliteConnection, pending: &PendingBlob<'_>) -> Result<()> {
        sqlx::query("DELETE FROM orphaned_blobs WHERE backing_location = ?")
            .bind(pending.location())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Insert a record with one reference. A concurrent creator surfaces as a
    /// unique violation (`AppError::is_unique_violation`).
    pub async fn insert_in(
        conn: &mut SqliteConnection,
        owner: &str,
        fingerprint: &str,
        byte_size: i64,
        backing_location: &str,
    ) -> Result<BlobRecord> {
        let blob = sqlx::query_as(
            r#"
            INSERT INTO blobs (owner, fingerprint, backing_location, byte_size, reference_count, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(fingerprint)
        .bind(backing_location)
        .bind(byte_size)
        .bind(db::now())
        .fetch_one(&mut *conn)
        .await?;
        Ok(blob)
    }

    /// Store new content and record it with one reference. Nothing is recorded
    /// unless the bytes were written; bytes are discarded if recording fails.
    pub async fn create_and_store(
        &self,
        owner: &str,
        fingerprint: &str,
        data: Bytes,
    ) -> Result<BlobRecord> {
        let _creation = self.lock_creation(owner, fingerprint).await;
        let byte_size = data.len() as i64;
        let pending = self.write_blob(fingerprint, data).await?;

        let recorded = async {
            let mut tx = self.db.pool().begin().await?;
            let blob =
                Self::insert_in(&mut tx, owner, fingerprint, byte_size, pending.location()).await?;
            Self::settle_in(&mut tx, &pending).await?;
            tx.commit().await?;
            Ok::<_, AppError>(blob)
        }
        .await;

        if recorded.is_err() {
            self.discard_blob(pending).await;
        }
        recorded
    }

    /// Best-effort removal of bytes that never got a committed record
    pub async fn discard_blob(&self, pending: PendingBlob<'_>) {
        self.purge_bytes(pending.location()).await;
    }

    // ==================== Detach ====================

    /// Atomically drop one reference, deleting the record when none remain
    pub async fn detach_in(
        conn: &mut SqliteConnection,
        owner: &str,
        fingerprint: &str,
    ) -> Result<DeletionOutcome> {
        let blob: BlobRecord = sqlx::query_as(
            r#"
            UPDATE blobs SET reference_count = reference_count - 1
            WHERE owner = ? AND fingerprint = ? AND reference_count > 0
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(fingerprint)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound("Blob not found".to_string()))?;

        if blob.reference_count > 0 {
            return Ok(DeletionOutcome::Retained {
                reference_count: blob.reference_count,
            });
        }

        sqlx::query("DELETE FROM blobs WHERE owner = ? AND fingerprint = ?")
            .bind(owner)
            .bind(fingerprint)
            .execute(&mut *conn)
            .await?;

        Ok(DeletionOutcome::Purged {
            backing_location: blob.backing_location,
        })
    }

    pub async fn decrement_reference_and_maybe_delete(
        &self,
        owner: &str,
        fingerprint: &str,
    ) -> Result<DeletionOutcome> {
        let mut tx = self.db.pool().begin().await?;
        let outcome = Self::detach_in(&mut tx, owner, fingerprint).await?;
        tx.commit().await?;
        self.finish_detach(&outcome).await;
        Ok(outcome)
    }

    /// Post-commit step of a detach: remove purged bytes
    pub async fn finish_detach(&self, outcome: &DeletionOutcome) -> Option<OrphanedBlob> {
        match outcome {
            DeletionOutcome::Purged { backing_location } => self.purge_bytes(backing_location).await,
            DeletionOutcome::Retained { .. } => None,
        }
    }

    // ==================== Orphans ====================

    /// Delete bytes; on failure log and record the location for a later sweep
    async fn purge_bytes(&self, location: &str) -> Option<OrphanedBlob> {
        let err = match self.store.delete(location).await {
            Ok(()) => {
                tracing::debug!("Purged blob bytes at {}", location);
                if let Err(e) = self.forget_orphan(location).await {
                    tracing::error!("Failed to clear orphan record {}: {}", location, e);
                }
                return None;
            }
            Err(e) => e,
        };

        tracing::warn!("Orphaned blob at {}: {}", location, err);
        let reason = err.to_string();
        match self.record_orphan(location, &reason).await {
            Ok(orphan) => Some(orphan),
            Err(e) => {
                tracing::error!("Failed to record orphaned blob {}: {}", location, e);
                None
            }
        }
    }

    async fn record_orphan(&self, location: &str, reason: &str) -> Result<OrphanedBlob> {
        let orphan = OrphanedBlob {
            backing_location: location.to_string(),
            reason: reason.to_string(),
            recorded_at: db::now(),
        };
        sqlx::query(
            "INSERT OR REPLACE INTO orphaned_blobs (backing_location, reason, recorded_at) VALUES (?, ?, ?)",
        )
        .bind(&orphan.backing_location)
        .bind(&orphan.reason)
        .bind(&orphan.recorded_at)
        .execute(self.db.pool())
        .await?;
        Ok(orphan)
    }

    async fn forget_orphan(&self, location: &str) -> Result<()> {
        sqlx::query("DELETE FROM orphaned_blobs WHERE backing_location = ?")
            .bind(location)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn orphaned_blobs(&self) -> Result<Vec<OrphanedBlob>> {
        let orphans = sqlx::query_as("SELECT * FROM orphaned_blobs ORDER BY recorded_at")
            .fetch_all(self.db.pool())
            .await?;
        Ok(orphans)
    }

    /// Retry deletion of recorded orphans; returns how many were removed.
    /// Locations still being written by this process are skipped.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let mut removed = 0;
        for orphan in self.orphaned_blobs().await? {
            let location = &orphan.backing_location;
            if self.writing.contains_key(location) {
                continue;
            }
            // A write that finished after the listing has settled its record by now
            let still_listed: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM orphaned_blobs WHERE backing_location = ?")
                    .bind(location)
                    .fetch_one(self.db.pool())
                    .await?;
            if still_listed == 0 {
                continue;
            }
            if let Err(e) = self.store.delete(location).await {
                tracing::debug!("Orphan {} still not deletable: {}", location, e);
                continue;
            }
            self.forget_orphan(location).await?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!("Swept {} orphaned blobs", removed);
        }
        Ok(removed)
    }
}
