//! Writer handle.

use std::sync::Arc;

use crate::arena::Arena;
use crate::state::{ChunkState, Packed, WriteState, WriterState};
use crate::{BufferError, BufferResult};

/// Exclusive write access to a [`RingBuffer`](crate::RingBuffer).
///
/// Bytes are written into the tail of the current chunk via
/// [`write_buffer`](Self::write_buffer) and published with
/// [`advance_write_position`](Self::advance_write_position). When the chunk
/// fills up, [`wait_to_write`](Self::wait_to_write) moves on to the next chunk
/// once every reader has drained it.
pub struct RingBufferWriter {
    arena: Arc<Arena>,
}

impl std::fmt::Debug for RingBufferWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferWriter")
            .field("chunk_idx", &self.arena.writer().chunk_idx)
            .finish_non_exhaustive()
    }
}

impl RingBufferWriter {
    pub(crate) const fn new(arena: Arc<Arena>) -> Self {
        Self { arena }
    }

    /// Length of every chunk in bytes; the largest contiguous write possible.
    #[must_use]
    pub fn chunk_length(&self) -> usize {
        self.arena.chunk_length()
    }

    fn current_chunk(&self) -> usize {
        usize::from(self.arena.writer().chunk_idx)
    }

    /// Whether [`mark_complete`](Self::mark_complete) has been called.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.arena.chunk(self.current_chunk()).write_state == WriteState::Complete
    }

    /// Unwritten tail of the current chunk.
    ///
    /// Empty when the current chunk is no longer being written.
    #[allow(unsafe_code)]
    pub fn write_buffer(&mut self) -> &mut [u8] {
        let idx = self.current_chunk();
        let chunk = self.arena.chunk(idx);
        if chunk.write_state != WriteState::Writing {
            return &mut [];
        }
        let length = chunk.length as usize;
        // SAFETY: bytes at or past the published length of a chunk in the
        // `Writing` state are invisible to readers, and `&mut self` makes this
        // the only writer.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.arena.chunk_ptr(idx).add(length),
                self.arena.chunk_length() - length,
            )
        }
    }

    /// Publish `size` bytes previously written into [`write_buffer`](Self::write_buffer).
    ///
    /// # Panics
    /// Panics if `size` exceeds the space left in the current chunk.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance_write_position(&mut self, size: usize) {
        if size == 0 {
            return;
        }
        let chunk_length = self.arena.chunk_length();
        let idx = self.current_chunk();
        let result = ChunkState::update(self.arena.chunk_word(idx), |c| {
            let length = c.length as usize + size;
            assert!(
                length <= chunk_length,
                "advanced {size} bytes past the end of chunk {idx}"
            );
            (c.write_state == WriteState::Writing).then_some(ChunkState {
                length: length as u32,
                ..c
            })
        });
        debug_assert!(result.is_ok(), "advanced a chunk that is not being written");
        self.arena.wake_readers();
    }

    /// Wait until at least `min_size` contiguous bytes are writable.
    ///
    /// Moves on to the next chunk when the current one is too full, waiting
    /// for every reader to drain it first. Cancel-safe: dropping the future
    /// leaves the buffer in a state a later call resumes from.
    ///
    /// # Errors
    /// Returns `RequestTooLarge` if `min_size` exceeds the chunk length, or
    /// `WriteAfterComplete` once the buffer was marked complete.
    pub async fn wait_to_write(&mut self, min_size: usize) -> BufferResult<()> {
        let chunk_length = self.arena.chunk_length();
        if min_size > chunk_length {
            return Err(BufferError::RequestTooLarge {
                requested: min_size,
                chunk_length,
            });
        }

        let current = self.current_chunk();
        let chunk = self.arena.chunk(current);
        match chunk.write_state {
            WriteState::Complete => return Err(BufferError::WriteAfterComplete),
            WriteState::Writing => {
                if chunk.length as usize + min_size <= chunk_length {
                    return Ok(());
                }
                let _ = ChunkState::update(self.arena.chunk_word(current), |c| {
                    (c.write_state == WriteState::Writing).then_some(ChunkState {
                        write_state: WriteState::MovedToNext,
                        ..c
                    })
                });
                self.arena.wake_readers();
            }
            // A previous wait was cancelled after leaving this chunk.
            WriteState::MovedToNext => {}
        }

        self.claim_next_chunk(current).await;
        Ok(())
    }

    async fn claim_next_chunk(&mut self, current: usize) {
        let next = self.arena.next_chunk(current);
        if next == 0 {
            // Wrapping is announced before chunk 0 is reused, so no reader can
            // be created that expects its old contents.
            let _ = WriterState::update(self.arena.writer_word(), |w| {
                (!w.has_wrapped).then_some(WriterState {
                    has_wrapped: true,
                    ..w
                })
            });
        }

        loop {
            let notified = self.arena.writer_event().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let chunk = self.arena.chunk(next);
            if chunk.reader_flags == 0 {
                let fresh = ChunkState::writing(self.arena.writer().reader_flags);
                if ChunkState::compare_exchange(self.arena.chunk_word(next), chunk, fresh).is_ok() {
                    break;
                }
                continue;
            }
            tracing::trace!(
                chunk = next,
                reader_flags = chunk.reader_flags,
                "Waiting for readers to drain chunk"
            );
            notified.await;
        }

        let mut writer = self.arena.writer();
        loop {
            #[allow(clippy::cast_possible_truncation)]
            let moved = WriterState {
                chunk_idx: next as u8,
                has_wrapped: writer.has_wrapped || next == 0,
                ..writer
            };
            match WriterState::compare_exchange(self.arena.writer_word(), writer, moved) {
                Ok(_) => break,
                Err(actual) => {
                    // Readers joined or left while the chunk was being claimed.
                    writer = actual;
                    let _ = ChunkState::update(self.arena.chunk_word(next), |c| {
                        Some(ChunkState {
                            reader_flags: actual.reader_flags,
                            ..c
                        })
                    });
                }
            }
        }
        self.arena.wake_readers();
    }

    /// Write all of `data`, spanning as many chunks as needed.
    ///
    /// # Errors
    /// Returns `WriteAfterComplete` once the buffer was marked complete.
    pub async fn write(&mut self, mut data: &[u8]) -> BufferResult<()> {
        while !data.is_empty() {
            self.wait_to_write(1).await?;
            let buffer = self.write_buffer();
            let size = buffer.len().min(data.len());
            buffer[..size].copy_from_slice(&data[..size]);
            self.advance_write_position(size);
            data = &data[size..];
        }
        Ok(())
    }

    /// Signal that no more data will be written.
    ///
    /// Returns `false` if the buffer was already complete.
    pub fn mark_complete(&mut self) -> bool {
        let idx = self.current_chunk();
        let result = ChunkState::update(self.arena.chunk_word(idx), |c| {
            (c.write_state != WriteState::Complete).then_some(ChunkState {
                write_state: WriteState::Complete,
                ..c
            })
        });
        self.arena.wake_readers();
        result.is_ok()
    }
}

impl Drop for RingBufferWriter {
    fn drop(&mut self) {
        let _ = WriterState::update(self.arena.writer_word(), |w| {
            Some(WriterState {
                ref_count: w.ref_count.saturating_sub(1),
                ..w
            })
        });
    }
}
