//! A channel pair: the inbound reader and outbound writer for one channel id.

use compute_buffer::{RingBufferReader, RingBufferWriter};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// One logical bidirectional stream multiplexed over a [`ComputeSocket`].
///
/// Bytes written to [`writer`](Self::writer) reach the peer's channel with
/// the same id; bytes the peer writes arrive in [`reader`](Self::reader).
///
/// [`ComputeSocket`]: crate::ComputeSocket
#[derive(Debug)]
pub struct ComputeChannel {
    id: i32,
    reader: RingBufferReader,
    writer: RingBufferWriter,
}

impl ComputeChannel {
    pub(crate) const fn new(id: i32, reader: RingBufferReader, writer: RingBufferWriter) -> Self {
        Self { id, reader, writer }
    }

    /// Channel id.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Inbound data.
    pub fn reader(&mut self) -> &mut RingBufferReader {
        &mut self.reader
    }

    /// Outbound data.
    pub fn writer(&mut self) -> &mut RingBufferWriter {
        &mut self.writer
    }

    /// Stop sending. The peer sees the end of the stream once it drains
    /// what was already written.
    pub fn close(&mut self) -> bool {
        self.writer.mark_complete()
    }

    /// Split into the inbound reader and outbound writer.
    #[must_use]
    pub fn into_parts(self) -> (RingBufferReader, RingBufferWriter) {
        (self.reader, self.writer)
    }

    /// Expose the channel as an `AsyncRead + AsyncWrite` stream.
    ///
    /// Two pump tasks move bytes between the channel buffers and an
    /// in-memory duplex pipe. Shutting down the write side of the returned
    /// stream completes the outbound buffer; the read side reaches end of
    /// stream once the peer detaches.
    #[must_use]
    pub fn into_stream(self) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (mut pipe_read, mut pipe_write) = tokio::io::split(remote);
        let Self {
            id,
            mut reader,
            mut writer,
        } = self;

        tokio::spawn(async move {
            let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
            loop {
                let n = reader.read_some(&mut buf).await;
                if n == 0 || pipe_write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = pipe_write.shutdown().await;
            tracing::trace!(channel_id = id, "Inbound pump finished");
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
            loop {
                match pipe_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Err(err) = writer.write(&buf[..n]).await {
                            tracing::debug!(channel_id = id, ?err, "Outbound pump stopped");
                            break;
                        }
                    }
                }
            }
            writer.mark_complete();
            tracing::trace!(channel_id = id, "Outbound pump finished");
        });

        local
    }
}
