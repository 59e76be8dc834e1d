//! In-memory blob storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use compute_core::{BlobLocator, BlobStorage, StorageError};

use super::slice_range;

/// In-memory storage implementation.
///
/// Useful for tests and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    blobs: RwLock<HashMap<BlobLocator, Bytes>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    async fn read_blob(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes, StorageError> {
        let data = self
            .blobs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(locator)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(locator.clone()))?;
        slice_range(locator, &data, offset, length)
    }

    async fn write_blob(&self, data: Bytes) -> Result<BlobLocator, StorageError> {
        let locator = BlobLocator::for_content(&data);
        self.blobs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(locator.clone())
            .or_insert(data);
        Ok(locator)
    }

    async fn blob_size(&self, locator: &BlobLocator) -> Result<u64, StorageError> {
        self.blobs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(locator)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(locator.clone()))
    }
}
