use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::Result;

/// Opaque blob store the ledger writes content into
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload data to storage
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Upload a file from a local path.
    /// The default reads the whole file and calls `put`.
    async fn put_file(&self, key: &str, local_path: &Path) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        self.put(key, Bytes::from(data)).await
    }

    /// Download data from storage
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Delete data from storage. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Get the storage type name
    fn backend_name(&self) -> &'static str;
}
