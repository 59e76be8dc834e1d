//! Packed state words shared by the writer and every reader.
//!
//! Each word is a plain `u64` held in an `AtomicU64` and is only ever changed
//! through compare-and-swap loops:
//!
//! ```text
//! chunk:  [ length:32 | reader_flags:16 | write_state:2 ]
//! writer: [ chunk_idx:8 | reader_flags:16 | ref_count:8 | has_wrapped:1 ]
//! reader: [ offset:32 | chunk_idx:8 | ref_count:8 | detached:1 ]
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// A value that round-trips through a single atomic word.
pub(crate) trait Packed: Copy {
    fn pack(self) -> u64;
    fn unpack(word: u64) -> Self;

    fn load(word: &AtomicU64) -> Self {
        Self::unpack(word.load(Ordering::Acquire))
    }

    /// CAS loop applying `f` until it succeeds or `f` declines with `None`.
    ///
    /// Returns the previous value on success and the current value when `f`
    /// declines.
    fn update(word: &AtomicU64, mut f: impl FnMut(Self) -> Option<Self>) -> Result<Self, Self> {
        word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            f(Self::unpack(w)).map(Self::pack)
        })
        .map(Self::unpack)
        .map_err(Self::unpack)
    }

    /// Single compare-and-swap against an exact expected value.
    fn compare_exchange(word: &AtomicU64, current: Self, new: Self) -> Result<Self, Self> {
        word.compare_exchange(
            current.pack(),
            new.pack(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(Self::unpack)
        .map_err(Self::unpack)
    }
}

/// Lifecycle of a chunk from the writer's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteState {
    /// The writer may still append to this chunk.
    Writing = 0,
    /// The writer has moved on; readers advance once they drain it.
    MovedToNext = 1,
    /// The stream ends inside this chunk.
    Complete = 2,
}

impl WriteState {
    const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Self::Writing,
            1 => Self::MovedToNext,
            _ => Self::Complete,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChunkState {
    pub length: u32,
    pub reader_flags: u16,
    pub write_state: WriteState,
}

impl ChunkState {
    pub const fn writing(reader_flags: u16) -> Self {
        Self {
            length: 0,
            reader_flags,
            write_state: WriteState::Writing,
        }
    }

    pub const fn has_reader(self, bit: u16) -> bool {
        self.reader_flags & bit != 0
    }
}

impl Packed for ChunkState {
    fn pack(self) -> u64 {
        u64::from(self.length)
            | (u64::from(self.reader_flags) << 32)
            | ((self.write_state as u64) << 48)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn unpack(word: u64) -> Self {
        Self {
            length: word as u32,
            reader_flags: (word >> 32) as u16,
            write_state: WriteState::from_bits(word >> 48),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WriterState {
    pub chunk_idx: u8,
    /// Readers every newly claimed chunk must be drained by.
    pub reader_flags: u16,
    pub ref_count: u8,
    pub has_wrapped: bool,
}

impl Packed for WriterState {
    fn pack(self) -> u64 {
        u64::from(self.chunk_idx)
            | (u64::from(self.reader_flags) << 8)
            | (u64::from(self.ref_count) << 24)
            | (u64::from(self.has_wrapped) << 32)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn unpack(word: u64) -> Self {
        Self {
            chunk_idx: word as u8,
            reader_flags: (word >> 8) as u16,
            ref_count: (word >> 24) as u8,
            has_wrapped: (word >> 32) & 1 != 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReaderState {
    pub offset: u32,
    pub chunk_idx: u8,
    pub ref_count: u8,
    pub detached: bool,
}

impl ReaderState {
    pub const FREE: Self = Self {
        offset: 0,
        chunk_idx: 0,
        ref_count: 0,
        detached: false,
    };
}

impl Packed for ReaderState {
    fn pack(self) -> u64 {
        u64::from(self.offset)
            | (u64::from(self.chunk_idx) << 32)
            | (u64::from(self.ref_count) << 40)
            | (u64::from(self.detached) << 48)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn unpack(word: u64) -> Self {
        Self {
            offset: word as u32,
            chunk_idx: (word >> 32) as u8,
            ref_count: (word >> 40) as u8,
            detached: (word >> 48) & 1 != 0,
        }
    }
}
