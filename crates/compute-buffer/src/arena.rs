//! Backing storage for a ring buffer.
//!
//! The arena owns the chunk bytes, one packed state word per chunk, the
//! writer word and one word per reader slot. Handles never see the arena
//! directly; they go through the typed accessors below.

use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU64;

use tokio::sync::Notify;

use crate::state::{ChunkState, Packed, ReaderState, WriterState};

pub(crate) struct Arena {
    num_readers: usize,
    num_chunks: usize,
    chunk_length: usize,
    data: Box<[UnsafeCell<u8>]>,
    chunks: Box<[AtomicU64]>,
    writer: AtomicU64,
    readers: Box<[AtomicU64]>,
    writer_event: Notify,
    reader_events: Box<[Notify]>,
}

// SAFETY: chunk bytes are only touched through raw pointers. The writer
// writes past a chunk's published length and readers read below it, and the
// length is published with release/acquire ordering, so the ranges never
// overlap between threads.
#[allow(unsafe_code)]
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(num_readers: usize, num_chunks: usize, chunk_length: usize) -> Self {
        Self {
            num_readers,
            num_chunks,
            chunk_length,
            data: (0..num_chunks * chunk_length)
                .map(|_| UnsafeCell::new(0))
                .collect(),
            chunks: (0..num_chunks)
                .map(|_| AtomicU64::new(ChunkState::writing(0).pack()))
                .collect(),
            writer: AtomicU64::new(0),
            readers: (0..num_readers)
                .map(|_| AtomicU64::new(ReaderState::FREE.pack()))
                .collect(),
            writer_event: Notify::new(),
            reader_events: (0..num_readers).map(|_| Notify::new()).collect(),
        }
    }

    pub const fn num_readers(&self) -> usize {
        self.num_readers
    }

    pub const fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub const fn chunk_length(&self) -> usize {
        self.chunk_length
    }

    pub const fn next_chunk(&self, idx: usize) -> usize {
        (idx + 1) % self.num_chunks
    }

    pub fn chunk_word(&self, idx: usize) -> &AtomicU64 {
        &self.chunks[idx]
    }

    pub fn chunk(&self, idx: usize) -> ChunkState {
        ChunkState::load(&self.chunks[idx])
    }

    pub const fn writer_word(&self) -> &AtomicU64 {
        &self.writer
    }

    pub fn writer(&self) -> WriterState {
        WriterState::load(&self.writer)
    }

    pub fn reader_word(&self, slot: usize) -> &AtomicU64 {
        &self.readers[slot]
    }

    pub fn reader(&self, slot: usize) -> ReaderState {
        ReaderState::load(&self.readers[slot])
    }

    pub const fn writer_event(&self) -> &Notify {
        &self.writer_event
    }

    pub fn reader_event(&self, slot: usize) -> &Notify {
        &self.reader_events[slot]
    }

    pub fn wake_writer(&self) {
        self.writer_event.notify_waiters();
    }

    pub fn wake_reader(&self, slot: usize) {
        self.reader_events[slot].notify_waiters();
    }

    pub fn wake_readers(&self) {
        for event in &self.reader_events {
            event.notify_waiters();
        }
    }

    /// Raw pointer to the first byte of chunk `idx`.
    pub fn chunk_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.num_chunks);
        UnsafeCell::raw_get(self.data[idx * self.chunk_length..].as_ptr())
    }

    /// Removes `bit` from the writer's reader set and from every chunk.
    ///
    /// Used when a reader detaches or its handle goes away, so a departed
    /// reader never holds the writer back.
    pub fn release_reader_flags(&self, bit: u16) {
        let _ = WriterState::update(&self.writer, |w| {
            (w.reader_flags & bit != 0).then_some(WriterState {
                reader_flags: w.reader_flags & !bit,
                ..w
            })
        });
        for word in &*self.chunks {
            let _ = ChunkState::update(word, |c| {
                c.has_reader(bit).then_some(ChunkState {
                    reader_flags: c.reader_flags & !bit,
                    ..c
                })
            });
        }
        self.wake_writer();
    }
}
