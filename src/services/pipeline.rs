use bytes::Bytes;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::db::Database;
use crate::error::Result;
use crate::models::{DeleteReceipt, FileResponse, UploadReceipt};
use crate::services::{
    ContentDigest, ContentHasher, ContentLedger, FileService, PendingBlob, QuotaAccountant,
    RateLimiter,
};

/// Content of an upload
pub enum UploadBody<'a> {
    /// Spooled to a local file. Hashed and stored straight from disk.
    Spooled(&'a Path),
    Memory(Bytes),
}

impl UploadBody<'_> {
    async fn digest(&self) -> Result<ContentDigest> {
        match self {
            UploadBody::Spooled(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                ContentHasher::fingerprint(&mut file).await
            }
            UploadBody::Memory(data) => ContentHasher::fingerprint(&mut Cursor::new(data)).await,
        }
    }
}

/// Admission pipeline for writes: rate limit, hash, dedup, quota, persist.
///
/// Admission failures (rate limit, quota) are raised before anything is written.
/// Once bytes are in the blob store, ledger and file rows commit together or not at all.
#[derive(Clone)]
pub struct Pipeline {
    db: Database,
    limiter: Arc<RateLimiter>,
    ledger: Arc<ContentLedger>,
    quota: QuotaAccountant,
}

impl Pipeline {
    pub fn new(
        db: Database,
        limiter: Arc<RateLimiter>,
        ledger: Arc<ContentLedger>,
        quota: QuotaAccountant,
    ) -> Self {
        Self {
            db,
            limiter,
            ledger,
            quota,
        }
    }

    pub fn ledger(&self) -> &Arc<ContentLedger> {
        &self.ledger
    }

    pub fn quota(&self) -> &QuotaAccountant {
        &self.quota
    }

    /// Upload a file for `owner`
    pub async fn upload(
        &self,
        owner: &str,
        body: UploadBody<'_>,
        display_name: &str,
        media_type: Option<&str>,
    ) -> Result<UploadReceipt> {
        let request_id = self.limiter.check(owner)?;
        self.upload_admitted(request_id, owner, body, display_name, media_type)
            .await
    }

    /// Upload for a call the rate limiter already admitted as `request_id`
    pub async fn upload_admitted(
        &self,
        request_id: String,
        owner: &str,
        body: UploadBody<'_>,
        display_name: &str,
        media_type: Option<&str>,
    ) -> Result<UploadReceipt> {
        FileService::validate_name(display_name)?;
        let media_type = FileService::normalize_media_type(media_type)?;
        let digest = body.digest().await?;

        if let Some(file) = self.attach(owner, &digest, display_name, &media_type).await? {
            return Ok(Self::receipt(request_id, file));
        }

        // Identical uploads by the same owner queue here; the winner creates, the rest attach
        let _creation = self.ledger.lock_creation(owner, &digest.fingerprint).await;
        if let Some(file) = self.attach(owner, &digest, display_name, &media_type).await? {
            return Ok(Self::receipt(request_id, file));
        }

        self.quota.admit(owner, digest.byte_size).await?.into_result()?;

        let pending = match body {
            UploadBody::Spooled(path) => {
                self.ledger.write_blob_file(&digest.fingerprint, path).await?
            }
            UploadBody::Memory(data) => self.ledger.write_blob(&digest.fingerprint, data).await?,
        };

        let committed = self
            .commit_new(owner, &digest, &pending, display_name, &media_type)
            .await;
        match committed {
            Ok(file) => {
                tracing::info!(
                    "Stored new content {} for {} ({} bytes)",
                    digest.fingerprint,
                    owner,
                    digest.byte_size
                );
                Ok(Self::receipt(request_id, file))
            }
            Err(e) => {
                self.ledger.discard_blob(pending).await;
                if !e.is_unique_violation() {
                    return Err(e);
                }
                // Another process created the blob first
                tracing::warn!(
                    "Lost creation race for {} ({}); attaching instead",
                    digest.fingerprint,
                    owner
                );
                match self.attach(owner, &digest, display_name, &media_type).await? {
                    Some(file) => Ok(Self::receipt(request_id, file)),
                    None => Err(e),
                }
            }
        }
    }

    /// Delete one of `owner`'s files and release its content reference
    pub async fn delete(&self, owner: &str, file_id: &str) -> Result<DeleteReceipt> {
        let request_id = self.limiter.check(owner)?;

        let mut tx = self.db.pool().begin().await?;
        let file = FileService::delete_in(&mut tx, owner, file_id).await?;
        let outcome = ContentLedger::detach_in(&mut tx, owner, &file.fingerprint).await?;
        tx.commit().await?;

        self.ledger.finish_detach(&outcome).await;
        tracing::info!("Deleted file {} for {}", file_id, owner);

        Ok(DeleteReceipt {
            request_id,
            purged: outcome.is_purged(),
        })
    }

    /// Add a file to existing content. `None` when the owner has no such content yet.
    async fn attach(
        &self,
        owner: &str,
        digest: &ContentDigest,
        display_name: &str,
        media_type: &str,
    ) -> Result<Option<FileResponse>> {
        let mut tx = self.db.pool().begin().await?;
        let Some(blob) = ContentLedger::attach_in(&mut tx, owner, &digest.fingerprint).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let file = FileService::insert_in(
            &mut tx,
            owner,
            &digest.fingerprint,
            display_name,
            media_type,
            true,
        )
        .await?;
        tx.commit().await?;

        tracing::debug!(
            "Attached {} to existing content {} (refs {})",
            file.id,
            digest.fingerprint,
            blob.reference_count
        );
        Ok(Some(FileResponse::new(file, blob.byte_size)))
    }

    /// Record new content and its first file. The quota is checked again under the
    /// write lock so two concurrent new uploads cannot both squeeze past it.
    async fn commit_new(
        &self,
        owner: &str,
        digest: &ContentDigest,
        pending: &PendingBlob<'_>,
        display_name: &str,
        media_type: &str,
    ) -> Result<FileResponse> {
        let mut tx = self.db.pool().begin().await?;
        let blob = ContentLedger::insert_in(
            &mut tx,
            owner,
            &digest.fingerprint,
            digest.byte_size,
            pending.location(),
        )
        .await?;
        ContentLedger::settle_in(&mut tx, pending).await?;
        self.quota
            .admit_in(&mut tx, owner, digest.byte_size)
            .await?
            .into_result()?;
        let file = FileService::insert_in(
            &mut tx,
            owner,
            &digest.fingerprint,
            display_name,
            media_type,
            false,
        )
        .await?;
        tx.commit().await?;

        Ok(FileResponse::new(file, blob.byte_size))
    }

    fn receipt(request_id: String, file: FileResponse) -> UploadReceipt {
        UploadReceipt {
            request_id,
            is_duplicate: file.is_duplicate,
            file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::models::FileFilter;
    use crate::error::AppError;
    use crate::storage::MemoryStorage;
    use std::time::Duration;
    use tempfile::TempDir;

    const MB: i64 = 1024 * 1024;

    struct Harness {
        pipeline: Pipeline,
        store: Arc<MemoryStorage>,
        db: Database,
        _dir: TempDir,
    }

    async fn harness_with(max_calls: u32, limit_bytes: i64) -> Harness {
        let (db, dir) = test_db().await;
        let store = Arc::new(MemoryStorage::new());
        let ledger = Arc::new(ContentLedger::new(db.clone(), store.clone()));
        let limiter = Arc::new(RateLimiter::new(max_calls, Duration::from_secs(60)));
        let quota = QuotaAccountant::new(db.clone(), limit_bytes);
        Harness {
            pipeline: Pipeline::new(db.clone(), limiter, ledger, quota),
            store,
            db,
            _dir: dir,
        }
    }

    async fn harness() -> Harness {
        harness_with(10_000, 10 * MB).await
    }

    async fn upload(p: &Pipeline, owner: &str, content: &[u8], name: &str) -> Result<UploadReceipt> {
        let body = UploadBody::Memory(Bytes::copy_from_slice(content));
        p.upload(owner, body, name, Some("text/plain")).await
    }

    async fn row_counts(db: &Database) -> (i64, i64) {
        let blobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blobs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(db.pool())
            .await
            .unwrap();
        (blobs, files)
    }

    #[tokio::test]
    async fn test_repeated_uploads_share_one_blob() {
        let h = harness().await;
        let mut receipts = Vec::new();
        for i in 0..5 {
            let name = format!("copy{}.txt", i);
            receipts.push(upload(&h.pipeline, "u1", b"same bytes", &name).await.unwrap());
        }

        assert!(!receipts[0].is_duplicate);
        assert!(receipts[1..].iter().all(|r| r.is_duplicate));
        assert_eq!(receipts[0].file.byte_size, 10);

        let fp = ContentHasher::fingerprint_bytes(b"same bytes");
        let blob = h.pipeline.ledger().find("u1", &fp).await.unwrap().unwrap();
        assert_eq!(blob.reference_count, 5);
        assert_eq!(row_counts(&h.db).await, (1, 5));
        assert_eq!(h.store.put_count(), 1);

        let originals: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE is_duplicate = 0")
                .fetch_one(h.db.pool())
                .await
                .unwrap();
        assert_eq!(originals, 1);

        assert_eq!(h.pipeline.quota().usage("u1").await.unwrap(), 10);
        assert!(h.pipeline.ledger().orphaned_blobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spooled_upload_is_stored_from_disk() {
        let h = harness().await;
        let spooled = h._dir.path().join("upload.tmp");
        tokio::fs::write(&spooled, b"spooled content").await.unwrap();

        let first = h
            .pipeline
            .upload("u1", UploadBody::Spooled(&spooled), "s.txt", None)
            .await
            .unwrap();
        assert!(!first.is_duplicate);
        assert_eq!(first.file.byte_size, 15);

        // Same fingerprint whichever way the bytes arrive
        let second = upload(&h.pipeline, "u1", b"spooled content", "m.txt").await.unwrap();
        assert!(second.is_duplicate);
        assert_eq!(h.store.put_count(), 1);

        let (_, data) = FileService::download(&h.db, h.pipeline.ledger(), "u1", &first.file.id)
            .await
            .unwrap();
        assert_eq!(data, Bytes::from_static(b"spooled content"));
    }

    #[tokio::test]
    async fn test_upload_admitted_keeps_request_id() {
        let h = harness_with(1, 10 * MB).await;
        let body = UploadBody::Memory(Bytes::from_static(b"pre-admitted"));
        let receipt = h
            .pipeline
            .upload_admitted("req-1".to_string(), "u1", body, "p.txt", None)
            .await
            .unwrap();
        assert_eq!(receipt.request_id, "req-1");

        // The limiter was not consulted again
        upload(&h.pipeline, "u1", b"counted", "c.txt").await.unwrap();
        assert!(matches!(
            upload(&h.pipeline, "u1", b"denied", "d.txt").await,
            Err(AppError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_deleting_every_copy_purges() {
        let h = harness().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(upload(&h.pipeline, "u1", b"temp", &format!("{}.txt", i)).await.unwrap().file.id);
        }

        assert!(!h.pipeline.delete("u1", &ids[0]).await.unwrap().purged);
        assert!(!h.pipeline.delete("u1", &ids[1]).await.unwrap().purged);
        assert!(h.pipeline.delete("u1", &ids[2]).await.unwrap().purged);

        assert_eq!(row_counts(&h.db).await, (0, 0));
        assert_eq!(h.store.object_count(), 0);

        // Gone is gone
        assert!(matches!(
            h.pipeline.delete("u1", &ids[2]).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_of_foreign_file_is_not_found() {
        let h = harness().await;
        let id = upload(&h.pipeline, "u1", b"mine", "m.txt").await.unwrap().file.id;

        assert!(matches!(
            h.pipeline.delete("u2", &id).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(row_counts(&h.db).await, (1, 1));
    }

    #[tokio::test]
    async fn test_dedup_is_per_owner() {
        let h = harness().await;
        let a = upload(&h.pipeline, "u1", b"shared", "a.txt").await.unwrap();
        let b = upload(&h.pipeline, "u2", b"shared", "b.txt").await.unwrap();

        assert!(!a.is_duplicate);
        assert!(!b.is_duplicate);
        assert_eq!(row_counts(&h.db).await, (2, 2));
        assert_eq!(h.store.put_count(), 2);

        // One owner's delete never touches the other's content
        assert!(h.pipeline.delete("u1", &a.file.id).await.unwrap().purged);
        let (meta, data) = FileService::download(&h.db, h.pipeline.ledger(), "u2", &b.file.id)
            .await
            .unwrap();
        assert_eq!(meta.id, b.file.id);
        assert_eq!(data, Bytes::from_static(b"shared"));
    }

    #[tokio::test]
    async fn test_quota_denial_leaves_no_trace() {
        let h = harness_with(10_000, 100).await;
        upload(&h.pipeline, "u1", &[1u8; 60], "a.bin").await.unwrap();

        let err = upload(&h.pipeline, "u1", &[2u8; 41], "b.bin").await.unwrap_err();
        match err {
            AppError::QuotaExceeded {
                current_usage_bytes,
                limit_bytes,
                attempted_upload_bytes,
            } => {
                assert_eq!(current_usage_bytes, 60);
                assert_eq!(limit_bytes, 100);
                assert_eq!(attempted_upload_bytes, 41);
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
        assert_eq!(row_counts(&h.db).await, (1, 1));
        assert_eq!(h.store.put_count(), 1);

        // Exactly at the limit is fine, and duplicates never count against it
        upload(&h.pipeline, "u1", &[2u8; 40], "c.bin").await.unwrap();
        upload(&h.pipeline, "u1", &[1u8; 60], "a-again.bin").await.unwrap();
        assert_eq!(h.pipeline.quota().usage("u1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_no_rows() {
        let h = harness().await;
        h.store.set_fail_puts(true);

        let err = upload(&h.pipeline, "u1", b"doomed", "d.txt").await.unwrap_err();
        assert!(matches!(err, AppError::StorageWriteFailed(_)));
        assert_eq!(row_counts(&h.db).await, (0, 0));

        h.store.set_fail_puts(false);
        let receipt = upload(&h.pipeline, "u1", b"doomed", "d.txt").await.unwrap();
        assert!(!receipt.is_duplicate);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_uploads_and_deletes() {
        let h = harness_with(2, 10 * MB).await;
        let first = upload(&h.pipeline, "u1", b"one", "1.txt").await.unwrap();
        upload(&h.pipeline, "u1", b"two", "2.txt").await.unwrap();

        let err = upload(&h.pipeline, "u1", b"three", "3.txt").await.unwrap_err();
        assert_eq!(err.to_string(), "Call Limit Reached");
        assert!(matches!(
            h.pipeline.delete("u1", &first.file.id).await,
            Err(AppError::RateLimited { .. })
        ));
        // Nothing was written for the rejected calls
        assert_eq!(row_counts(&h.db).await, (2, 2));

        // Other users are unaffected
        upload(&h.pipeline, "u2", b"three", "3.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_writing() {
        let h = harness().await;
        let err = upload(&h.pipeline, "u1", b"x", "  ").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(h.store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_media_type_defaults() {
        let h = harness().await;
        let body = UploadBody::Memory(Bytes::from_static(b"raw"));
        let receipt = h.pipeline.upload("u1", body, "raw", None).await.unwrap();
        assert_eq!(receipt.file.media_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_failed_purge_is_recorded_not_raised() {
        let h = harness().await;
        let id = upload(&h.pipeline, "u1", b"sticky", "s.txt").await.unwrap().file.id;

        h.store.set_fail_deletes(true);
        let receipt = h.pipeline.delete("u1", &id).await.unwrap();
        assert!(receipt.purged);
        assert_eq!(row_counts(&h.db).await, (0, 0));
        assert_eq!(h.pipeline.ledger().orphaned_blobs().await.unwrap().len(), 1);

        h.store.set_fail_deletes(false);
        assert_eq!(h.pipeline.ledger().sweep_orphans().await.unwrap(), 1);
        assert_eq!(h.store.object_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_uploads_write_once() {
        let h = harness().await;
        let pipeline = Arc::new(h.pipeline.clone());
        const K: usize = 8;

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..K {
            let pipeline = pipeline.clone();
            tasks.spawn(async move {
                let body = UploadBody::Memory(Bytes::from_static(b"racing content"));
                pipeline.upload("u1", body, &format!("r{}.txt", i), None).await
            });
        }
        let mut originals = 0;
        while let Some(res) = tasks.join_next().await {
            if !res.unwrap().unwrap().is_duplicate {
                originals += 1;
            }
        }

        assert_eq!(originals, 1);
        assert_eq!(h.store.put_count(), 1);
        let fp = ContentHasher::fingerprint_bytes(b"racing content");
        let blob = pipeline.ledger().find("u1", &fp).await.unwrap().unwrap();
        assert_eq!(blob.reference_count, K as i64);
        assert_eq!(row_counts(&h.db).await, (1, K as i64));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deletes_leave_the_rest() {
        let h = harness().await;
        const N: usize = 10;
        const M: usize = 6;
        let mut ids = Vec::new();
        for i in 0..N {
            ids.push(upload(&h.pipeline, "u1", b"many", &format!("{}.txt", i)).await.unwrap().file.id);
        }

        let pipeline = Arc::new(h.pipeline.clone());
        let mut tasks = tokio::task::JoinSet::new();
        for id in ids.into_iter().take(M) {
            let pipeline = pipeline.clone();
            tasks.spawn(async move { pipeline.delete("u1", &id).await });
        }
        while let Some(res) = tasks.join_next().await {
            assert!(!res.unwrap().unwrap().purged);
        }

        let fp = ContentHasher::fingerprint_bytes(b"many");
        let blob = pipeline.ledger().find("u1", &fp).await.unwrap().unwrap();
        assert_eq!(blob.reference_count, (N - M) as i64);

        let listed = FileService::list_files(&h.db, "u1", &FileFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.total, (N - M) as i64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_new_uploads_respect_quota() {
        let h = harness_with(10_000, 100).await;
        let pipeline = Arc::new(h.pipeline.clone());

        // Each fits alone; any two together do not
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..4u8 {
            let pipeline = pipeline.clone();
            tasks.spawn(async move {
                let body = UploadBody::Memory(Bytes::from(vec![i; 60]));
                pipeline.upload("u1", body, "big.bin", None).await
            });
        }
        let mut accepted = 0;
        while let Some(res) = tasks.join_next().await {
            match res.unwrap() {
                Ok(_) => accepted += 1,
                Err(AppError::QuotaExceeded { .. }) => {}
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(pipeline.quota().usage("u1").await.unwrap(), 60);
        assert_eq!(row_counts(&h.db).await, (1, 1));
        // Losers that got as far as writing took their bytes back
        assert_eq!(h.store.object_count(), 1);
        assert!(pipeline.ledger().orphaned_blobs().await.unwrap().is_empty());
    }
}
