pub mod local;
pub mod memory;
pub mod provider;

pub use local::*;
pub use memory::*;
pub use provider::*;

use std::sync::Arc;

use crate::config::StorageConfig;

/// Build the blob store configured for this deployment
pub fn from_config(config: &StorageConfig) -> Arc<dyn BlobStore> {
    let store = LocalStorage::new(&config.local_path);
    tracing::info!("Blob store: {} at {}", store.backend_name(), config.local_path);
    Arc::new(store)
}
