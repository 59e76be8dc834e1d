//! Reader handles.

use std::sync::Arc;

use crate::arena::Arena;
use crate::state::{ChunkState, Packed, ReaderState, WriteState, WriterState};

/// One independent read cursor over a [`RingBuffer`](crate::RingBuffer).
///
/// Each reader owns a slot in the buffer. The writer will not reuse a chunk
/// until every reader holding a flag on it has moved past. Dropping the
/// handle releases the slot.
pub struct RingBufferReader {
    arena: Arc<Arena>,
    slot: usize,
}

impl std::fmt::Debug for RingBufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.arena.reader(self.slot);
        f.debug_struct("RingBufferReader")
            .field("slot", &self.slot)
            .field("chunk_idx", &state.chunk_idx)
            .field("offset", &state.offset)
            .field("detached", &state.detached)
            .finish()
    }
}

/// Mark `slot` detached and stop the writer from flagging new chunks for it.
///
/// Flags already set on chunks are cleared by the reader itself the next
/// time it waits, because it may still be borrowing their bytes.
pub(crate) fn detach_slot(arena: &Arena, slot: usize) {
    let bit = 1u16 << slot;
    let _ = ReaderState::update(arena.reader_word(slot), |r| {
        (!r.detached).then_some(ReaderState {
            detached: true,
            ..r
        })
    });
    let _ = WriterState::update(arena.writer_word(), |w| {
        (w.reader_flags & bit != 0).then_some(WriterState {
            reader_flags: w.reader_flags & !bit,
            ..w
        })
    });
    arena.wake_reader(slot);
}

impl RingBufferReader {
    pub(crate) const fn new(arena: Arc<Arena>, slot: usize) -> Self {
        Self { arena, slot }
    }

    /// Index of the slot this reader occupies.
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    const fn bit(&self) -> u16 {
        1 << self.slot
    }

    /// Whether the reader has been detached.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.arena.reader(self.slot).detached
    }

    /// Whether the reader has consumed everything the writer will ever write.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let state = self.arena.reader(self.slot);
        if state.detached {
            return true;
        }
        let chunk = self.arena.chunk(usize::from(state.chunk_idx));
        chunk.has_reader(self.bit())
            && chunk.write_state == WriteState::Complete
            && state.offset == chunk.length
    }

    /// Unread bytes of the current chunk.
    ///
    /// Empty if the writer has not reached this reader's chunk yet or the
    /// reader is detached.
    #[allow(unsafe_code)]
    #[must_use]
    pub fn read_buffer(&self) -> &[u8] {
        let state = self.arena.reader(self.slot);
        if state.detached {
            return &[];
        }
        let idx = usize::from(state.chunk_idx);
        let chunk = self.arena.chunk(idx);
        if !chunk.has_reader(self.bit()) || state.offset >= chunk.length {
            return &[];
        }
        let offset = state.offset as usize;
        // SAFETY: the bytes below the chunk's published length were written
        // before the length was released, and the writer cannot reuse the
        // chunk while this reader's flag is set. The flag is only cleared
        // inside `wait_to_read`, which takes `&mut self`, or on drop.
        unsafe {
            std::slice::from_raw_parts(
                self.arena.chunk_ptr(idx).add(offset),
                chunk.length as usize - offset,
            )
        }
    }

    /// Consume `size` bytes from [`read_buffer`](Self::read_buffer).
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance_read_position(&mut self, size: usize) {
        debug_assert!(
            size <= self.read_buffer().len(),
            "advanced past the readable data"
        );
        if size == 0 {
            return;
        }
        let _ = ReaderState::update(self.arena.reader_word(self.slot), |r| {
            Some(ReaderState {
                offset: r.offset + size as u32,
                ..r
            })
        });
    }

    /// Wait until at least `min_length` contiguous bytes are readable.
    ///
    /// Returns `false` when no more data can arrive for this request: the
    /// stream is complete, the reader is detached, or fewer than
    /// `min_length` bytes remain in a finished chunk. Cancel-safe.
    pub async fn wait_to_read(&mut self, min_length: usize) -> bool {
        let bit = self.bit();
        loop {
            let notified = self.arena.reader_event(self.slot).notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.arena.reader(self.slot);
            if state.detached {
                self.arena.release_reader_flags(bit);
                return false;
            }

            let idx = usize::from(state.chunk_idx);
            let chunk = self.arena.chunk(idx);
            if !chunk.has_reader(bit) {
                // The writer has not claimed this chunk for us yet.
                notified.await;
                continue;
            }

            let offset = state.offset as usize;
            let length = chunk.length as usize;
            if offset + min_length <= length {
                return true;
            }

            match chunk.write_state {
                WriteState::Writing => notified.await,
                WriteState::Complete => return false,
                WriteState::MovedToNext if offset < length => return false,
                WriteState::MovedToNext => self.move_to_next_chunk(idx),
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn move_to_next_chunk(&self, idx: usize) {
        let bit = self.bit();
        let next = self.arena.next_chunk(idx);
        let _ = ReaderState::update(self.arena.reader_word(self.slot), |r| {
            Some(ReaderState {
                chunk_idx: next as u8,
                offset: 0,
                ..r
            })
        });
        let _ = ChunkState::update(self.arena.chunk_word(idx), |c| {
            c.has_reader(bit).then_some(ChunkState {
                reader_flags: c.reader_flags & !bit,
                ..c
            })
        });
        self.arena.wake_writer();
    }

    /// Copy up to `buf.len()` bytes out of the buffer.
    ///
    /// Returns 0 once the stream is complete.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() || !self.wait_to_read(1).await {
            return 0;
        }
        let available = self.read_buffer();
        let size = available.len().min(buf.len());
        buf[..size].copy_from_slice(&available[..size]);
        self.advance_read_position(size);
        size
    }

    /// Fill `buf` completely, reading across chunk boundaries.
    ///
    /// Returns `false` if the stream ended first; the bytes read so far are
    /// left in `buf`.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> bool {
        let mut filled = 0;
        while filled < buf.len() {
            let size = self.read_some(&mut buf[filled..]).await;
            if size == 0 {
                return false;
            }
            filled += size;
        }
        true
    }

    /// Force this reader into the detached state.
    ///
    /// A detached reader reports completion and the writer stops flagging
    /// new chunks for it. Chunks it was already flagged on stay held until
    /// the reader's next [`wait_to_read`](Self::wait_to_read) or until the
    /// handle is dropped.
    pub fn detach(&self) {
        detach_slot(&self.arena, self.slot);
    }
}

impl Drop for RingBufferReader {
    fn drop(&mut self) {
        self.arena.release_reader_flags(self.bit());
        let _ = ReaderState::update(self.arena.reader_word(self.slot), |_| {
            Some(ReaderState::FREE)
        });
    }
}
