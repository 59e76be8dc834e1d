//! On-disk content-addressed blob storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use compute_core::{BlobLocator, BlobStorage, StorageError};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// File storage implementation.
///
/// Each blob lives in `<root>/<first two hex digits>/<locator>`.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, locator: &BlobLocator) -> Result<PathBuf, StorageError> {
        if !locator.is_digest() {
            return Err(StorageError::InvalidLocator(locator.clone()));
        }
        let name = locator.as_str();
        Ok(self.root.join(&name[..2]).join(name))
    }

    async fn open_blob(&self, locator: &BlobLocator) -> Result<tokio::fs::File, StorageError> {
        let path = self.blob_path(locator)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(locator.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStorage for FileStorage {
    async fn read_blob(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes, StorageError> {
        let mut file = self.open_blob(locator).await?;
        let size = file.metadata().await?.len();
        let length = length.unwrap_or_else(|| size.saturating_sub(offset));
        if offset.checked_add(length).is_none_or(|end| end > size) {
            return Err(StorageError::OutOfRange {
                locator: locator.clone(),
                offset,
                length,
                size,
            });
        }

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; usize::try_from(length).map_err(std::io::Error::other)?];
        file.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }

    async fn write_blob(&self, data: Bytes) -> Result<BlobLocator, StorageError> {
        let locator = BlobLocator::for_content(&data);
        let path = self.blob_path(&locator)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(locator);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write under a temporary name so readers never see a partial blob.
        let staging = path.with_extension("partial");
        tokio::fs::write(&staging, &data).await?;
        tokio::fs::rename(&staging, &path).await?;
        tracing::debug!(%locator, size = data.len(), "Stored blob");
        Ok(locator)
    }

    async fn blob_size(&self, locator: &BlobLocator) -> Result<u64, StorageError> {
        let file = self.open_blob(locator).await?;
        Ok(file.metadata().await?.len())
    }
}
