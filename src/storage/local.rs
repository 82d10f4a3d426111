use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::BlobStore;

/// Local file system blob store
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn get_full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(AppError::BadRequest(format!("Invalid blob key: {}", key)));
        }
        Ok(self.base_path.join(relative))
    }

    /// Remove empty directories between `dir` and the base path
    async fn prune_empty_parents(&self, mut current_dir: Option<PathBuf>) {
        while let Some(dir) = current_dir {
            if dir == self.base_path || !dir.starts_with(&self.base_path) {
                break;
            }
            match fs::read_dir(&dir).await {
                Ok(mut entries) => match entries.next_entry().await {
                    Ok(None) => {
                        let _ = fs::remove_dir(&dir).await;
                    }
                    _ => break,
                },
                Err(_) => break,
            }
            current_dir = dir.parent().map(|p| p.to_path_buf());
        }
    }
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let full_path = self.get_full_path(key)?;

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::StorageWriteFailed(e.to_string()))?;
        }

        let write = async {
            let mut file = fs::File::create(&full_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        write
            .await
            .map_err(|e| AppError::StorageWriteFailed(format!("{}: {}", key, e)))?;

        tracing::debug!("Saved blob to {:?}", full_path);
        Ok(())
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> Result<()> {
        let full_path = self.get_full_path(key)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::StorageWriteFailed(e.to_string()))?;
        }

        // Copy file
        fs::copy(local_path, &full_path)
            .await
            .map_err(|e| AppError::StorageWriteFailed(format!("{}: {}", key, e)))?;

        tracing::debug!("Copied file from {:?} to {:?}", local_path, full_path);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let full_path = self.get_full_path(key)?;

        let data = fs::read(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("Blob not found: {}", key))
            } else {
                AppError::Storage(format!("Failed to read blob: {}", e))
            }
        })?;

        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.get_full_path(key)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => {
                tracing::debug!("Deleted blob {:?}", full_path);
                self.prune_empty_parents(full_path.parent().map(|p| p.to_path_buf()))
                    .await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("Failed to delete blob: {}", e))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.get_full_path(key)?;
        Ok(fs::try_exists(&full_path).await?)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
