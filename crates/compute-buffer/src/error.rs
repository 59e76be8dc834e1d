//! Errors raised by ring buffer construction and handle allocation.

use thiserror::Error;

use crate::{MAX_CHUNKS, MAX_READERS};

/// Convenience result alias for buffer operations.
pub type BufferResult<T, E = BufferError> = Result<T, E>;

/// Errors surfaced by the ring buffer.
///
/// Everything here is a capacity or ordering violation on the caller's side;
/// none of these are worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("Too many readers requested: {0} (maximum {MAX_READERS})")]
    TooManyReaders(usize),
    #[error("Invalid chunk count: {0} (must be 1..={MAX_CHUNKS})")]
    InvalidChunkCount(usize),
    #[error("Invalid chunk length: {0}")]
    InvalidChunkLength(usize),
    #[error("All {0} reader slots are in use")]
    ReadersExhausted(usize),
    #[error("Buffer already has a writer")]
    WriterExists,
    #[error("Buffer has wrapped; a new reader could never observe the overwritten data")]
    BufferWrapped,
    #[error("Requested {requested} bytes but chunks hold only {chunk_length}")]
    RequestTooLarge { requested: usize, chunk_length: usize },
    #[error("Buffer was marked complete; no further writes are accepted")]
    WriteAfterComplete,
}

impl BufferError {
    /// Whether this error reports an exhausted handle slot.
    #[must_use]
    pub const fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ReadersExhausted(_) | Self::WriterExists)
    }
}
