use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{AppError, Result};
use crate::storage::BlobStore;

/// In-process blob store. Counts writes and can be told to fail.
#[derive(Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Bytes>,
    puts: AtomicUsize,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryStorage {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(AppError::StorageWriteFailed(format!("{}: injected failure", key)));
        }
        self.objects.insert(key.to_string(), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("Blob not found: {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AppError::Storage(format!("{}: injected failure", key)));
        }
        self.objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(key))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
