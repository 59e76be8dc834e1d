//! Storage implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "memory")]
pub use memory::MemoryStorage;

#[cfg(feature = "file")]
pub use file::FileStorage;

use bytes::Bytes;
use compute_core::{BlobLocator, StorageError};

/// Slice `[offset, offset + length)` out of a whole blob.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn slice_range(
    locator: &BlobLocator,
    data: &Bytes,
    offset: u64,
    length: Option<u64>,
) -> Result<Bytes, StorageError> {
    let size = data.len() as u64;
    let length = length.unwrap_or_else(|| size.saturating_sub(offset));
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(data.slice(offset as usize..end as usize)),
        _ => Err(StorageError::OutOfRange {
            locator: locator.clone(),
            offset,
            length,
            size,
        }),
    }
}
