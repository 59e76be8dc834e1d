//! Core abstractions for remote compute.
//!
//! This crate provides the fundamental building blocks:
//! - `ExecuteRequest` - what to run on a remote agent
//! - `BlobLocator` / `DirectoryNode` - content-addressed storage types
//! - `resolve_in_sandbox` - path confinement for remote file operations
//! - Storage and process launcher traits

pub mod context;
pub mod locator;
pub mod sandbox;
pub mod traits;

pub use context::{EXECUTE_FLAG_REPLACE_ENVIRONMENT, ExecuteRequest};
pub use locator::{BlobLocator, DirectoryEntry, DirectoryNode, FileEntry};
pub use sandbox::{SandboxViolation, resolve_in_sandbox};
pub use traits::{
    BlobStorage, LaunchError, LaunchRequest, LaunchedProcess, ProcessLauncher, StorageError,
};
