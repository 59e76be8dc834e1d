//! The shared ring buffer and its handle factories.

use std::sync::Arc;

use crate::arena::Arena;
use crate::state::{ChunkState, Packed, ReaderState, WriterState};
use crate::{BufferError, BufferResult, MAX_CHUNKS, MAX_READERS, RingBufferReader, RingBufferWriter};

/// Protocol default chunk count.
pub const DEFAULT_NUM_CHUNKS: usize = 2;

/// Protocol default chunk length (512 KiB).
pub const DEFAULT_CHUNK_LENGTH: usize = 512 * 1024;

/// Default number of reader slots.
pub const DEFAULT_NUM_READERS: usize = 1;

/// Geometry of a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    /// Number of reader slots (at most [`MAX_READERS`]).
    pub num_readers: usize,
    /// Number of chunks (at most [`MAX_CHUNKS`]).
    pub num_chunks: usize,
    /// Length in bytes of every chunk.
    pub chunk_length: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            num_readers: DEFAULT_NUM_READERS,
            num_chunks: DEFAULT_NUM_CHUNKS,
            chunk_length: DEFAULT_CHUNK_LENGTH,
        }
    }
}

impl BufferOptions {
    /// Options for a buffer holding roughly `capacity` bytes across the default chunk count.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chunk_length: capacity.div_ceil(DEFAULT_NUM_CHUNKS).max(1),
            ..Self::default()
        }
    }

    /// Override the reader slot count.
    #[must_use]
    pub const fn readers(mut self, num_readers: usize) -> Self {
        self.num_readers = num_readers;
        self
    }

    /// Override the chunk count.
    #[must_use]
    pub const fn chunks(mut self, num_chunks: usize) -> Self {
        self.num_chunks = num_chunks;
        self
    }

    /// Override the chunk length.
    #[must_use]
    pub const fn chunk_length(mut self, chunk_length: usize) -> Self {
        self.chunk_length = chunk_length;
        self
    }
}

/// Fixed-capacity chunked circular buffer with one writer and up to
/// [`MAX_READERS`] independent readers.
///
/// Cloning is cheap and shares the same storage; the storage is released once
/// every clone and every reader/writer handle has been dropped.
#[derive(Clone)]
pub struct RingBuffer {
    arena: Arc<Arena>,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("num_readers", &self.arena.num_readers())
            .field("num_chunks", &self.arena.num_chunks())
            .field("chunk_length", &self.arena.chunk_length())
            .finish_non_exhaustive()
    }
}

impl RingBuffer {
    /// Create a buffer.
    ///
    /// # Errors
    /// Returns error if the reader or chunk count exceeds the protocol
    /// maximum of 16, or the chunk length does not fit a chunk state word.
    pub fn create(num_readers: usize, num_chunks: usize, chunk_length: usize) -> BufferResult<Self> {
        if num_readers == 0 || num_readers > MAX_READERS {
            return Err(BufferError::TooManyReaders(num_readers));
        }
        if num_chunks == 0 || num_chunks > MAX_CHUNKS {
            return Err(BufferError::InvalidChunkCount(num_chunks));
        }
        if chunk_length == 0 || u32::try_from(chunk_length).is_err() {
            return Err(BufferError::InvalidChunkLength(chunk_length));
        }
        tracing::trace!(num_readers, num_chunks, chunk_length, "Creating ring buffer");
        Ok(Self {
            arena: Arc::new(Arena::new(num_readers, num_chunks, chunk_length)),
        })
    }

    /// Create a buffer from [`BufferOptions`].
    ///
    /// # Errors
    /// See [`RingBuffer::create`].
    pub fn with_options(options: BufferOptions) -> BufferResult<Self> {
        Self::create(options.num_readers, options.num_chunks, options.chunk_length)
    }

    /// Create a single-reader buffer with the protocol default geometry.
    ///
    /// # Errors
    /// See [`RingBuffer::create`].
    pub fn create_default() -> BufferResult<Self> {
        Self::with_options(BufferOptions::default())
    }

    /// Length of every chunk in bytes.
    #[must_use]
    pub fn chunk_length(&self) -> usize {
        self.arena.chunk_length()
    }

    /// Number of chunks.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.arena.num_chunks()
    }

    /// Whether the writer has wrapped back to the first chunk.
    #[must_use]
    pub fn has_wrapped(&self) -> bool {
        self.arena.writer().has_wrapped
    }

    /// Allocate the single writer handle.
    ///
    /// # Errors
    /// Returns `WriterExists` if a writer handle is still alive.
    pub fn create_writer(&self) -> BufferResult<RingBufferWriter> {
        WriterState::update(self.arena.writer_word(), |w| {
            (w.ref_count == 0).then_some(WriterState { ref_count: 1, ..w })
        })
        .map_err(|_| BufferError::WriterExists)?;
        Ok(RingBufferWriter::new(Arc::clone(&self.arena)))
    }

    /// Allocate a reader positioned at the start of the stream.
    ///
    /// The reader observes every byte written so far, so creation fails once
    /// the writer has begun reusing chunks.
    ///
    /// # Errors
    /// Returns `ReadersExhausted` if every slot is in use, or `BufferWrapped`
    /// if the writer has already wrapped.
    pub fn create_reader(&self) -> BufferResult<RingBufferReader> {
        if self.has_wrapped() {
            return Err(BufferError::BufferWrapped);
        }
        let slot = self.claim_reader_slot()?;
        let bit = 1u16 << slot;

        // Flag every chunk written so far, then publish the reader to the
        // writer. If the writer moved on in between, flag the new chunks too
        // and retry; if it wrapped, back out.
        let mut covered: Option<usize> = None;
        loop {
            let writer = self.arena.writer();
            if writer.has_wrapped {
                self.abandon_reader_slot(slot, bit);
                return Err(BufferError::BufferWrapped);
            }
            let current = usize::from(writer.chunk_idx);
            let start = covered.map_or(0, |c| c + 1);
            for idx in start..=current {
                let _ = ChunkState::update(self.arena.chunk_word(idx), |c| {
                    Some(ChunkState {
                        reader_flags: c.reader_flags | bit,
                        ..c
                    })
                });
            }
            covered = Some(covered.map_or(current, |c| c.max(current)));

            let published = WriterState {
                reader_flags: writer.reader_flags | bit,
                ..writer
            };
            if WriterState::compare_exchange(self.arena.writer_word(), writer, published).is_ok() {
                break;
            }
        }

        tracing::trace!(slot, "Created ring buffer reader");
        Ok(RingBufferReader::new(Arc::clone(&self.arena), slot))
    }

    /// Force every reader into the detached state.
    ///
    /// Detached readers report completion immediately and stop holding the
    /// writer back. Used when a channel must be torn down without the
    /// writer's cooperation.
    pub fn detach_readers(&self) {
        for slot in 0..self.arena.num_readers() {
            if self.arena.reader(slot).ref_count > 0 {
                crate::reader::detach_slot(&self.arena, slot);
            }
        }
    }

    fn claim_reader_slot(&self) -> BufferResult<usize> {
        for slot in 0..self.arena.num_readers() {
            let claimed = ReaderState::update(self.arena.reader_word(slot), |r| {
                (r.ref_count == 0).then_some(ReaderState {
                    ref_count: 1,
                    ..ReaderState::FREE
                })
            });
            if claimed.is_ok() {
                return Ok(slot);
            }
        }
        Err(BufferError::ReadersExhausted(self.arena.num_readers()))
    }

    fn abandon_reader_slot(&self, slot: usize, bit: u16) {
        self.arena.release_reader_flags(bit);
        let _ = ReaderState::update(self.arena.reader_word(slot), |_| Some(ReaderState::FREE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_rejects_oversized_geometry() {
        assert_eq!(
            RingBuffer::create(17, 2, 64).unwrap_err(),
            BufferError::TooManyReaders(17)
        );
        assert_eq!(
            RingBuffer::create(1, 17, 64).unwrap_err(),
            BufferError::InvalidChunkCount(17)
        );
        assert_eq!(
            RingBuffer::create(1, 2, 0).unwrap_err(),
            BufferError::InvalidChunkLength(0)
        );
        assert!(RingBuffer::create(16, 16, 64).is_ok());
    }

    #[test]
    fn test_second_writer_is_resource_exhausted() {
        let buffer = RingBuffer::create(1, 2, 64).unwrap();
        let writer = buffer.create_writer().unwrap();
        let err = buffer.create_writer().unwrap_err();
        assert!(err.is_resource_exhausted());

        drop(writer);
        assert!(buffer.create_writer().is_ok());
    }

    #[test]
    fn test_seventeenth_reader_fails() {
        let buffer = RingBuffer::create(16, 4, 64).unwrap();
        let readers: Vec<_> = (0..16).map(|_| buffer.create_reader().unwrap()).collect();
        let err = buffer.create_reader().unwrap_err();
        assert_eq!(err, BufferError::ReadersExhausted(16));
        assert!(err.is_resource_exhausted());
        assert_eq!(readers.len(), 16);
    }

    #[test]
    fn test_reader_slot_reused_after_drop() {
        let buffer = RingBuffer::create(1, 2, 64).unwrap();
        let reader = buffer.create_reader().unwrap();
        assert!(buffer.create_reader().is_err());
        drop(reader);
        assert!(buffer.create_reader().is_ok());
    }

    #[test]
    fn test_options_with_capacity() {
        let options = BufferOptions::with_capacity(1000).readers(3);
        assert_eq!(options.num_chunks, DEFAULT_NUM_CHUNKS);
        assert_eq!(options.chunk_length, 500);
        assert_eq!(options.num_readers, 3);
        assert!(RingBuffer::with_options(options).is_ok());
    }
}
