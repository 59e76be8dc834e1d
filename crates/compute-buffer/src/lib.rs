//! Chunked ring buffer backing compute channels.
//!
//! Provides:
//! - `RingBuffer` - fixed-capacity chunked storage shared by one writer and
//!   up to 16 readers
//! - `RingBufferWriter` / `RingBufferReader` - ref-counted handles
//! - `BufferError` - capacity and ordering violations
//!
//! All hot-path coordination happens through packed atomic state words
//! updated with compare-and-swap loops; waiting is done on per-slot
//! [`tokio::sync::Notify`] events.

mod arena;
mod buffer;
mod error;
mod reader;
mod state;
mod writer;

pub use buffer::{
    BufferOptions, DEFAULT_CHUNK_LENGTH, DEFAULT_NUM_CHUNKS, DEFAULT_NUM_READERS, RingBuffer,
};
pub use error::{BufferError, BufferResult};
pub use reader::RingBufferReader;
pub use writer::RingBufferWriter;

/// Maximum number of reader slots. Fixed by the packed header layout.
pub const MAX_READERS: usize = 16;

/// Maximum number of chunks. Fixed by the packed header layout.
pub const MAX_CHUNKS: usize = 16;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};

    use super::*;

    async fn drain(mut reader: RingBufferReader) -> Vec<u8> {
        let mut out = Vec::new();
        while reader.wait_to_read(1).await {
            let data = reader.read_buffer();
            out.extend_from_slice(data);
            let size = data.len();
            reader.advance_read_position(size);
        }
        out
    }

    #[tokio::test]
    async fn test_single_reader_round_trip() {
        let buffer = RingBuffer::create(1, 4, 8).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        let reader = buffer.create_reader().unwrap();

        let consumer = tokio::spawn(drain(reader));
        writer.write(b"hello, ring buffer world").await.unwrap();
        assert!(writer.mark_complete());

        let received = consumer.await.unwrap();
        assert_eq!(received, b"hello, ring buffer world");
    }

    #[tokio::test]
    async fn test_mark_complete_is_idempotent() {
        let buffer = RingBuffer::create(1, 2, 16).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        let mut reader = buffer.create_reader().unwrap();

        writer.write(b"abc").await.unwrap();
        assert!(writer.mark_complete());
        assert!(!writer.mark_complete());
        assert!(writer.is_complete());

        assert!(!reader.is_complete());
        assert!(reader.wait_to_read(3).await);
        assert_eq!(reader.read_buffer(), b"abc");
        assert!(!reader.is_complete());
        reader.advance_read_position(3);
        assert!(reader.is_complete());
        assert!(!reader.wait_to_read(1).await);
    }

    #[tokio::test]
    async fn test_write_after_complete_fails() {
        let buffer = RingBuffer::create(1, 2, 16).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        writer.mark_complete();
        assert_eq!(
            writer.wait_to_write(1).await.unwrap_err(),
            BufferError::WriteAfterComplete
        );
        assert!(writer.write_buffer().is_empty());
    }

    #[tokio::test]
    async fn test_wait_to_write_rejects_oversized_request() {
        let buffer = RingBuffer::create(1, 2, 16).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        let err = writer.wait_to_write(17).await.unwrap_err();
        assert_eq!(
            err,
            BufferError::RequestTooLarge {
                requested: 17,
                chunk_length: 16
            }
        );
    }

    #[tokio::test]
    async fn test_reader_waits_for_min_length() {
        let buffer = RingBuffer::create(1, 2, 16).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        let mut reader = buffer.create_reader().unwrap();

        writer.write(b"ab").await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(50), reader.wait_to_read(4)).await;
        assert!(pending.is_err(), "reader should still be waiting for 4 bytes");

        writer.write(b"cd").await.unwrap();
        assert!(reader.wait_to_read(4).await);
        assert_eq!(reader.read_buffer(), b"abcd");
    }

    #[tokio::test]
    async fn test_reader_created_after_wrap_fails() {
        let buffer = RingBuffer::create(1, 2, 4).unwrap();
        let mut writer = buffer.create_writer().unwrap();

        writer.write(b"1234").await.unwrap();
        writer.write(b"5678").await.unwrap();
        assert!(!buffer.has_wrapped());

        // Late readers still see everything written before the wrap.
        let mut late = buffer.create_reader().unwrap();
        let mut first = [0u8; 8];
        assert!(late.read_exact(&mut first).await);
        assert_eq!(&first, b"12345678");

        writer.write(b"9").await.unwrap();
        assert!(buffer.has_wrapped());
        drop(late);
        assert_eq!(buffer.create_reader().unwrap_err(), BufferError::BufferWrapped);
    }

    #[tokio::test]
    async fn test_writer_blocks_on_undrained_chunk() {
        let buffer = RingBuffer::create(1, 2, 4).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        let mut reader = buffer.create_reader().unwrap();

        writer.write(b"aaaabbbb").await.unwrap();
        // Chunk 0 is still flagged for the reader, so wrapping must wait.
        let blocked = tokio::time::timeout(Duration::from_millis(50), writer.write(b"c")).await;
        assert!(blocked.is_err());

        let mut chunk = [0u8; 4];
        assert!(reader.read_exact(&mut chunk).await);
        assert_eq!(&chunk, b"aaaa");
        // Reading into the second chunk releases the first.
        assert!(reader.wait_to_read(1).await);

        writer.write(b"c").await.unwrap();
        writer.mark_complete();
        let rest = drain(reader).await;
        assert_eq!(rest, b"bbbbc");
    }

    #[tokio::test]
    async fn test_waiting_reader_follows_writer_into_next_chunk() {
        let buffer = RingBuffer::create(1, 2, 4).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        let mut reader = buffer.create_reader().unwrap();

        writer.write(b"abcd").await.unwrap();
        let mut first = [0u8; 4];
        assert!(reader.read_exact(&mut first).await);

        let pending = tokio::time::timeout(Duration::from_millis(50), reader.wait_to_read(1)).await;
        assert!(pending.is_err(), "nothing written past the first chunk yet");

        writer.write(b"e").await.unwrap();
        assert!(reader.wait_to_read(1).await);
        assert_eq!(reader.read_buffer(), b"e");
    }

    #[tokio::test]
    async fn test_detach_unblocks_writer_and_completes_reader() {
        let buffer = RingBuffer::create(2, 2, 4).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        let mut stalled = buffer.create_reader().unwrap();
        let active = buffer.create_reader().unwrap();
        let consumer = tokio::spawn(drain(active));

        writer.write(b"abcdefgh").await.unwrap();
        stalled.detach();
        assert!(stalled.is_complete());
        assert!(!stalled.wait_to_read(1).await);

        writer.write(b"ijkl").await.unwrap();
        writer.mark_complete();
        assert_eq!(consumer.await.unwrap(), b"abcdefghijkl");
    }

    #[tokio::test]
    async fn test_detach_readers_from_buffer() {
        let buffer = RingBuffer::create(2, 2, 8).unwrap();
        let mut a = buffer.create_reader().unwrap();
        let mut b = buffer.create_reader().unwrap();
        buffer.detach_readers();
        assert!(a.is_detached());
        assert!(!a.wait_to_read(1).await);
        assert!(!b.wait_to_read(1).await);
    }

    #[tokio::test]
    async fn test_single_chunk_buffer() {
        let buffer = RingBuffer::create(1, 1, 3).unwrap();
        let mut writer = buffer.create_writer().unwrap();
        let reader = buffer.create_reader().unwrap();
        let consumer = tokio::spawn(drain(reader));

        writer.write(b"abcdefghij").await.unwrap();
        writer.mark_complete();
        assert_eq!(consumer.await.unwrap(), b"abcdefghij");
    }

    /// Randomised stress: differently paced readers, many wraps, arbitrary
    /// write sizes. Every reader must see the exact byte stream.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_multi_reader_fuzz() {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let num_readers = 16;
        let buffer = RingBuffer::create(num_readers, 4, 61).unwrap();
        let mut writer = buffer.create_writer().unwrap();

        let mut payload = vec![0u8; 20_000];
        rng.fill_bytes(&mut payload);

        let mut consumers = Vec::new();
        for idx in 0..num_readers {
            let mut reader = buffer.create_reader().unwrap();
            let seed = rng.next_u64();
            consumers.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut out = Vec::new();
                let mut scratch = vec![0u8; 97];
                loop {
                    let want = rng.gen_range(1..=scratch.len());
                    let size = reader.read_some(&mut scratch[..want]).await;
                    if size == 0 {
                        break;
                    }
                    out.extend_from_slice(&scratch[..size]);
                    if idx % 3 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                out
            }));
        }

        let mut remaining = payload.as_slice();
        while !remaining.is_empty() {
            let size = rng.gen_range(1..=remaining.len().min(150));
            writer.write(&remaining[..size]).await.unwrap();
            remaining = &remaining[size..];
        }
        writer.mark_complete();
        assert!(buffer.has_wrapped());

        for consumer in consumers {
            let received = consumer.await.unwrap();
            assert_eq!(received.len(), payload.len());
            assert_eq!(received, payload);
        }
    }
}
