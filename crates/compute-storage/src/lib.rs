//! Blob storage backends for remote compute.
//!
//! Provides:
//! - Storage implementations (memory, file)
//! - Directory tree upload and materialization

pub mod storage;
pub mod tree;

#[cfg(feature = "memory")]
pub use storage::MemoryStorage;

#[cfg(feature = "file")]
pub use storage::FileStorage;

pub use tree::{TreeError, materialize_tree, upload_directory};
