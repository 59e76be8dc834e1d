//! Upload and materialize directory trees.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use compute_core::{
    BlobLocator, BlobStorage, DirectoryEntry, DirectoryNode, FileEntry, SandboxViolation,
    StorageError, resolve_in_sandbox,
};
use thiserror::Error;

/// Tree transfer error.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sandbox(#[from] SandboxViolation),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid entry name: {0:?}")]
    InvalidName(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TreeError + '_ {
    move |source| TreeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Single path component, no separators or dot segments.
fn check_name(name: &str) -> Result<(), TreeError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(TreeError::InvalidName(name.to_string()))
    }
}

/// Upload a local directory and return the locator of its root node.
///
/// # Errors
/// Returns error if the directory cannot be read or a blob cannot be stored.
pub async fn upload_directory(
    storage: &dyn BlobStorage,
    dir: &Path,
) -> Result<BlobLocator, TreeError> {
    let mut node = DirectoryNode::default();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error(dir))?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error(dir))? {
        children.push(entry.path());
    }
    children.sort();

    for path in children {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata = tokio::fs::metadata(&path).await.map_err(io_error(&path))?;
        if metadata.is_dir() {
            let locator = Box::pin(upload_directory(storage, &path)).await?;
            node.directories.push(DirectoryEntry { name, locator });
        } else {
            let data = tokio::fs::read(&path).await.map_err(io_error(&path))?;
            let length = data.len() as u64;
            let locator = storage.write_blob(Bytes::from(data)).await?;
            node.files.push(FileEntry {
                name,
                locator,
                length,
            });
        }
    }

    Ok(storage.write_tree(&node).await?)
}

/// Write the tree at `locator` into `target`, which must lie inside `sandbox`.
///
/// Returns the number of files written.
///
/// # Errors
/// Returns `Sandbox` if `target` escapes the sandbox, `InvalidName` for entry
/// names that are not a single path component, or storage/I/O failures.
pub async fn materialize_tree(
    storage: &dyn BlobStorage,
    locator: &BlobLocator,
    sandbox: &Path,
    target: &str,
) -> Result<usize, TreeError> {
    let root = resolve_in_sandbox(sandbox, target)?;
    materialize_node(storage, locator, &root).await
}

async fn materialize_node(
    storage: &dyn BlobStorage,
    locator: &BlobLocator,
    dir: &Path,
) -> Result<usize, TreeError> {
    let node = storage.read_tree(locator).await?;
    tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;

    let mut written = 0;
    for file in &node.files {
        check_name(&file.name)?;
        let path = dir.join(&file.name);
        let data = storage.read_blob(&file.locator, 0, None).await?;
        tokio::fs::write(&path, &data).await.map_err(io_error(&path))?;
        tracing::trace!(path = %path.display(), size = data.len(), "Wrote file");
        written += 1;
    }
    for child in &node.directories {
        check_name(&child.name)?;
        let path = dir.join(&child.name);
        written += Box::pin(materialize_node(storage, &child.locator, &path)).await?;
    }
    Ok(written)
}
