use bytes::Bytes;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::db::{self, Database};
use crate::error::{AppError, Result};
use crate::models::{FileFilter, FileListResponse, FileRecord, FileResponse};
use crate::services::ContentLedger;

/// Longest accepted display name, in characters
pub const MAX_NAME_LEN: usize = 255;
/// Longest accepted media type
pub const MAX_MEDIA_TYPE_LEN: usize = 100;
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

const FILE_COLUMNS: &str = r#"
    SELECT f.id, f.owner, f.fingerprint, f.display_name, f.media_type, f.created_at,
           f.is_duplicate, b.byte_size
    FROM files f
    JOIN blobs b ON b.owner = f.owner AND b.fingerprint = f.fingerprint
"#;

/// File catalog service
pub struct FileService;

impl FileService {
    /// Validate a display name
    pub fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(AppError::BadRequest("File name is required".to_string()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(AppError::BadRequest(format!(
                "File name exceeds {} characters",
                MAX_NAME_LEN
            )));
        }
        Ok(())
    }

    /// Normalize a media type, falling back to `application/octet-stream`
    pub fn normalize_media_type(media_type: Option<&str>) -> Result<String> {
        let media_type = match media_type.map(str::trim) {
            Some(m) if !m.is_empty() => m,
            _ => return Ok(DEFAULT_MEDIA_TYPE.to_string()),
        };
        if media_type.len() > MAX_MEDIA_TYPE_LEN {
            return Err(AppError::BadRequest(format!(
                "Media type exceeds {} characters",
                MAX_MEDIA_TYPE_LEN
            )));
        }
        Ok(media_type.to_string())
    }

    /// Get a file by ID. Files owned by someone else are reported as missing.
    pub async fn get_file(db: &Database, owner: &str, file_id: &str) -> Result<FileResponse> {
        let sql = format!("{} WHERE f.id = ? AND f.owner = ?", FILE_COLUMNS);
        let file: FileResponse = sqlx::query_as(&sql)
            .bind(file_id)
            .bind(owner)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        Ok(file)
    }

    /// List the owner's files, newest first
    pub async fn list_files(
        db: &Database,
        owner: &str,
        filter: &FileFilter,
    ) -> Result<FileListResponse> {
        let page = filter.page();
        let page_size = filter.page_size();

        let mut count = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM files f JOIN blobs b ON b.owner = f.owner AND b.fingerprint = f.fingerprint",
        );
        Self::push_filters(&mut count, owner, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(db.pool())
            .await?;

        let mut query = QueryBuilder::<Sqlite>::new(FILE_COLUMNS);
        Self::push_filters(&mut query, owner, filter);
        query
            .push(" ORDER BY f.created_at DESC, f.id DESC LIMIT ")
            .push_bind(page_size as i64)
            .push(" OFFSET ")
            .push_bind((page as i64 - 1) * page_size as i64);
        let files = query
            .build_query_as::<FileResponse>()
            .fetch_all(db.pool())
            .await?;

        Ok(FileListResponse {
            files,
            total,
            page,
            page_size,
        })
    }

    fn push_filters<'a>(query: &mut QueryBuilder<'a, Sqlite>, owner: &'a str, filter: &'a FileFilter) {
        query.push(" WHERE f.owner = ").push_bind(owner);

        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            query
                .push(" AND LOWER(f.display_name) LIKE ")
                .push_bind(format!("%{}%", search.to_lowercase()));
        }
        if let Some(media_type) = filter.media_type.as_deref().filter(|s| !s.is_empty()) {
            query.push(" AND f.media_type = ").push_bind(media_type);
        }
        if let Some(min) = filter.min_size {
            query.push(" AND b.byte_size >= ").push_bind(min);
        }
        if let Some(max) = filter.max_size {
            query.push(" AND b.byte_size <= ").push_bind(max);
        }
        // Unparseable dates are ignored
        if let Some(start) = filter.start_date.as_deref().and_then(parse_date) {
            query.push(" AND f.created_at >= ").push_bind(start);
        }
        if let Some(end) = filter.end_date.as_deref().and_then(parse_date) {
            query.push(" AND f.created_at <= ").push_bind(end);
        }
    }

    /// Distinct media types across the owner's files
    pub async fn file_types(db: &Database, owner: &str) -> Result<Vec<String>> {
        let types: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT media_type FROM files WHERE owner = ? ORDER BY media_type",
        )
        .bind(owner)
        .fetch_all(db.pool())
        .await?;

        Ok(types)
    }

    /// File metadata plus its bytes
    pub async fn download(
        db: &Database,
        ledger: &ContentLedger,
        owner: &str,
        file_id: &str,
    ) -> Result<(FileResponse, Bytes)> {
        let file = Self::get_file(db, owner, file_id).await?;
        let blob = ledger
            .find(owner, &file.fingerprint)
            .await?
            .ok_or_else(|| AppError::NotFound("File content not found".to_string()))?;
        let data = ledger.read(&blob).await?;
        Ok((file, data))
    }

    /// Insert a file row on the caller's connection
    pub async fn insert_in(
        conn: &mut SqliteConnection,
        owner: &str,
        fingerprint: &str,
        display_name: &str,
        media_type: &str,
        is_duplicate: bool,
    ) -> Result<FileRecord> {
        let file = sqlx::query_as(
            r#"
            INSERT INTO files (id, owner, fingerprint, display_name, media_type, created_at, is_duplicate)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner)
        .bind(fingerprint)
        .bind(display_name)
        .bind(media_type)
        .bind(db::now())
        .bind(is_duplicate)
        .fetch_one(&mut *conn)
        .await?;

        Ok(file)
    }

    /// Delete the owner's file row on the caller's connection
    pub async fn delete_in(
        conn: &mut SqliteConnection,
        owner: &str,
        file_id: &str,
    ) -> Result<FileRecord> {
        let file = sqlx::query_as("DELETE FROM files WHERE id = ? AND owner = ? RETURNING *")
            .bind(file_id)
            .bind(owner)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        Ok(file)
    }
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DD` (start of day, UTC)
fn parse_date(s: &str) -> Option<String> {
    let parsed = match DateTime::parse_from_rfc3339(s) {
        Ok(d) => d.with_timezone(&Utc),
        Err(_) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?
            .and_utc(),
    };
    Some(parsed.to_rfc3339_opts(SecondsFormat::Micros, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::services::quota::tests::seed;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    async fn set_created(db: &Database, fingerprint: &str, created_at: &str) {
        sqlx::query("UPDATE files SET created_at = ? WHERE fingerprint = ?")
            .bind(created_at)
            .bind(fingerprint)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[test]
    fn test_validate_name() {
        assert!(FileService::validate_name("a.txt").is_ok());
        assert!(FileService::validate_name("   ").is_err());
        assert!(FileService::validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(FileService::validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_normalize_media_type() {
        assert_eq!(FileService::normalize_media_type(None).unwrap(), DEFAULT_MEDIA_TYPE);
        assert_eq!(FileService::normalize_media_type(Some(" ")).unwrap(), DEFAULT_MEDIA_TYPE);
        assert_eq!(
            FileService::normalize_media_type(Some("text/plain")).unwrap(),
            "text/plain"
        );
        assert!(FileService::normalize_media_type(Some(&"x".repeat(101))).is_err());
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2026-03-01").as_deref(),
            Some("2026-03-01T00:00:00.000000Z")
        );
        assert_eq!(
            parse_date("2026-03-01T10:00:00+02:00").as_deref(),
            Some("2026-03-01T08:00:00.000000Z")
        );
        assert!(parse_date("yesterday").is_none());
    }

    #[tokio::test]
    async fn test_get_file_is_owner_scoped() {
        let (db, _dir) = test_db().await;
        seed(&db, "u1", "a", 42, 1).await;
        let id: String = sqlx::query_scalar("SELECT id FROM files")
            .fetch_one(db.pool())
            .await
            .unwrap();

        let file = FileService::get_file(&db, "u1", &id).await.unwrap();
        assert_eq!(file.byte_size, 42);
        assert_eq!(file.fingerprint, "a");

        assert!(matches!(
            FileService::get_file(&db, "u2", &id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            FileService::get_file(&db, "u1", "missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_files_filters_and_pages() {
        let (db, _dir) = test_db().await;
        seed(&db, "u1", "small", 10, 1).await;
        seed(&db, "u1", "big", 1000, 2).await;
        seed(&db, "u2", "other", 10, 1).await;
        set_created(&db, "small", "2026-01-01T00:00:00.000000Z").await;
        set_created(&db, "big", "2026-02-01T00:00:00.000000Z").await;

        let all = FileService::list_files(&db, "u1", &FileFilter::default()).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.page, 1);
        assert_eq!(all.page_size, 20);
        assert_eq!(all.files[0].fingerprint, "big");
        assert_eq!(all.files[2].fingerprint, "small");

        let filter = FileFilter {
            min_size: Some(100),
            ..Default::default()
        };
        let big = FileService::list_files(&db, "u1", &filter).await.unwrap();
        assert_eq!(big.total, 2);
        assert!(big.files.iter().all(|f| f.byte_size == 1000));

        let filter = FileFilter {
            search: Some("SMALL-0".to_string()),
            ..Default::default()
        };
        let found = FileService::list_files(&db, "u1", &filter).await.unwrap();
        assert_eq!(found.total, 1);
        assert_eq!(found.files[0].display_name, "small-0.txt");

        let filter = FileFilter {
            end_date: Some("2026-01-15".to_string()),
            ..Default::default()
        };
        let early = FileService::list_files(&db, "u1", &filter).await.unwrap();
        assert_eq!(early.total, 1);

        let filter = FileFilter {
            page: Some(2),
            page_size: Some(2),
            ..Default::default()
        };
        let second = FileService::list_files(&db, "u1", &filter).await.unwrap();
        assert_eq!(second.total, 3);
        assert_eq!(second.files.len(), 1);
        assert_eq!(second.files[0].fingerprint, "small");
    }

    #[tokio::test]
    async fn test_file_types() {
        let (db, _dir) = test_db().await;
        seed(&db, "u1", "a", 1, 2).await;
        assert_eq!(
            FileService::file_types(&db, "u1").await.unwrap(),
            vec!["text/plain".to_string()]
        );
        assert!(FileService::file_types(&db, "u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download() {
        let (db, _dir) = test_db().await;
        let ledger = ContentLedger::new(db.clone(), Arc::new(MemoryStorage::new()));
        let fp = crate::services::ContentHasher::fingerprint_bytes(b"payload");
        ledger
            .create_and_store("u1", &fp, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let file = FileService::insert_in(&mut conn, "u1", &fp, "p.bin", DEFAULT_MEDIA_TYPE, false)
            .await
            .unwrap();
        drop(conn);

        let (meta, data) = FileService::download(&db, &ledger, "u1", &file.id).await.unwrap();
        assert_eq!(meta.byte_size, 7);
        assert_eq!(data, Bytes::from_static(b"payload"));
        assert!(FileService::download(&db, &ledger, "u2", &file.id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_in_requires_owner() {
        let (db, _dir) = test_db().await;
        seed(&db, "u1", "a", 1, 1).await;
        let id: String = sqlx::query_scalar("SELECT id FROM files")
            .fetch_one(db.pool())
            .await
            .unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        assert!(matches!(
            FileService::delete_in(&mut conn, "u2", &id).await,
            Err(AppError::NotFound(_))
        ));
        let deleted = FileService::delete_in(&mut conn, "u1", &id).await.unwrap();
        assert_eq!(deleted.id, id);
    }
}
