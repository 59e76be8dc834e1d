//! Collaborator traits: blob storage and process launching.

use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{BlobLocator, DirectoryNode};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(BlobLocator),
    #[error("Range {offset}+{length} is outside blob {locator} of {size} bytes")]
    OutOfRange {
        locator: BlobLocator,
        offset: u64,
        length: u64,
        size: u64,
    },
    #[error("Invalid locator: {0}")]
    InvalidLocator(BlobLocator),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed directory node: {0}")]
    Json(#[from] serde_json::Error),
}

/// Content-addressed blob storage client.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Read `length` bytes at `offset` from a blob.
    ///
    /// A `length` of `None` reads to the end of the blob.
    async fn read_blob(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes, StorageError>;

    /// Store a blob and return its locator.
    async fn write_blob(&self, data: Bytes) -> Result<BlobLocator, StorageError>;

    /// Total size of a blob.
    async fn blob_size(&self, locator: &BlobLocator) -> Result<u64, StorageError> {
        Ok(self.read_blob(locator, 0, None).await?.len() as u64)
    }

    /// Read and decode a directory node.
    async fn read_tree(&self, locator: &BlobLocator) -> Result<DirectoryNode, StorageError> {
        let data = self.read_blob(locator, 0, None).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Encode and store a directory node.
    async fn write_tree(&self, node: &DirectoryNode) -> Result<BlobLocator, StorageError> {
        let data = serde_json::to_vec(node)?;
        self.write_blob(Bytes::from(data)).await
    }
}

/// Launcher error.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully resolved process launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Executable path or bare name, resolved by the launcher.
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    /// Absolute working directory.
    pub working_dir: PathBuf,
    /// Environment overrides. A `None` value removes the variable.
    pub env: BTreeMap<String, Option<String>>,
    /// Start from an empty environment.
    pub clear_env: bool,
}

/// A running process launched by a [`ProcessLauncher`].
#[async_trait]
pub trait LaunchedProcess: Send {
    /// OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Read the next chunk of combined stdout/stderr output.
    ///
    /// Returns 0 once the output stream has closed.
    async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize, LaunchError>;

    /// Wait for the process to exit and return its exit code.
    async fn wait(&mut self) -> Result<i32, LaunchError>;

    /// Kill the process and everything it spawned.
    async fn kill(&mut self) -> Result<(), LaunchError>;
}

/// Trait for OS process launchers.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn a process.
    async fn spawn(&self, request: LaunchRequest) -> Result<Box<dyn LaunchedProcess>, LaunchError>;
}
