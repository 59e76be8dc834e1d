//! Channel-multiplexing socket.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use compute_buffer::{BufferOptions, RingBuffer, RingBufferReader, RingBufferWriter};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::ComputeChannel,
    error::{SocketError, SocketResult},
    frame::{FrameHeader, read_header},
};

/// Default grace period for [`ComputeSocket::close`].
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest payload sent in a single frame.
const MAX_FRAME_PAYLOAD: usize = 1 << 30;

type TransportRead = Box<dyn AsyncRead + Send + Unpin>;
type TransportWrite = Box<dyn AsyncWrite + Send + Unpin>;
type InboundRoute = Arc<tokio::sync::Mutex<RingBufferWriter>>;

/// Socket configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketConfig {
    /// How long [`ComputeSocket::close`] lets background tasks drain
    /// before cancelling them.
    pub close_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Routes {
    inbound: HashMap<i32, InboundRoute>,
    /// Set once the receive loop has exited; later routes complete at once.
    closed: bool,
}

#[derive(Default)]
struct Tasks {
    receive: Option<JoinHandle<()>>,
    send: Vec<JoinHandle<()>>,
    closing: bool,
}

struct SocketInner {
    config: SocketConfig,
    transport_read: Mutex<Option<TransportRead>>,
    /// Serializes every physical write so frames never interleave.
    transport_write: tokio::sync::Mutex<TransportWrite>,
    routes: Mutex<Routes>,
    tasks: Mutex<Tasks>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Multiplexes channels over one duplex byte stream.
///
/// Inbound frames are dispatched by a single receive loop, started on the
/// first [`attach_recv_buffer`](Self::attach_recv_buffer). Every outbound
/// buffer gets its own send task. Cloning the socket shares it.
#[derive(Clone)]
pub struct ComputeSocket {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for ComputeSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = lock(&self.inner.routes);
        f.debug_struct("ComputeSocket")
            .field("channels", &routes.inbound.keys().collect::<Vec<_>>())
            .field("closed", &routes.closed)
            .finish_non_exhaustive()
    }
}

impl ComputeSocket {
    /// Create a socket over `transport` with the default configuration.
    pub fn new<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(transport, SocketConfig::default())
    }

    /// Create a socket over `transport`.
    pub fn with_config<T>(transport: T, config: SocketConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(transport);
        Self {
            inner: Arc::new(SocketInner {
                config,
                transport_read: Mutex::new(Some(Box::new(read))),
                transport_write: tokio::sync::Mutex::new(Box::new(write)),
                routes: Mutex::new(Routes::default()),
                tasks: Mutex::new(Tasks::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Socket configuration.
    #[must_use]
    pub fn config(&self) -> SocketConfig {
        self.inner.config
    }

    /// Whether the receive side has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.routes).closed
    }

    /// Route inbound frames for `channel_id` into `writer`.
    ///
    /// If the socket has already stopped receiving, the writer is marked
    /// complete instead so its readers see the end of the stream.
    ///
    /// # Errors
    /// Returns `ChannelInUse` if the channel already has an inbound route.
    pub fn attach_recv_buffer(
        &self,
        channel_id: i32,
        mut writer: RingBufferWriter,
    ) -> SocketResult<()> {
        let mut routes = lock(&self.inner.routes);
        if routes.closed {
            drop(routes);
            writer.mark_complete();
            tracing::debug!(channel_id, "Socket closed; completed inbound buffer");
            return Ok(());
        }
        if routes.inbound.contains_key(&channel_id) {
            return Err(SocketError::ChannelInUse(channel_id));
        }
        routes
            .inbound
            .insert(channel_id, Arc::new(tokio::sync::Mutex::new(writer)));
        drop(routes);

        self.start_receive_loop();
        tracing::trace!(channel_id, "Attached inbound buffer");
        Ok(())
    }

    /// Forward everything written to `reader`'s buffer as frames on
    /// `channel_id`, followed by a detach frame once the buffer completes.
    ///
    /// # Errors
    /// Returns `Closed` once [`close`](Self::close) has started.
    pub fn attach_send_buffer(&self, channel_id: i32, reader: RingBufferReader) -> SocketResult<()> {
        let mut tasks = lock(&self.inner.tasks);
        if tasks.closing {
            return Err(SocketError::Closed);
        }
        tasks.send.retain(|task| !task.is_finished());
        tasks
            .send
            .push(tokio::spawn(send_loop(Arc::clone(&self.inner), channel_id, reader)));
        tracing::trace!(channel_id, "Attached outbound buffer");
        Ok(())
    }

    /// Allocate both buffers for `channel_id`, attach them and return the
    /// local ends.
    ///
    /// # Errors
    /// Returns `Buffer` for invalid geometry, `ChannelInUse` or `Closed`.
    pub fn create_channel(
        &self,
        channel_id: i32,
        options: BufferOptions,
    ) -> SocketResult<ComputeChannel> {
        let inbound = RingBuffer::with_options(options)?;
        let outbound = RingBuffer::with_options(options)?;
        let reader = inbound.create_reader()?;
        let writer = outbound.create_writer()?;

        self.attach_recv_buffer(channel_id, inbound.create_writer()?)?;
        self.attach_send_buffer(channel_id, outbound.create_reader()?)?;
        Ok(ComputeChannel::new(channel_id, reader, writer))
    }

    /// Close with the configured grace period.
    pub async fn close(&self) {
        self.close_with_timeout(self.inner.config.close_timeout)
            .await;
    }

    /// Close the socket.
    ///
    /// Send tasks get `timeout` to drain their buffers, then everything still
    /// running is cancelled. The transport's write side is shut down and the
    /// receive loop is awaited. Errors from a peer that is already gone are
    /// ignored.
    pub async fn close_with_timeout(&self, timeout: Duration) {
        let (sends, receive) = {
            let mut tasks = lock(&self.inner.tasks);
            tasks.closing = true;
            (std::mem::take(&mut tasks.send), tasks.receive.take())
        };

        let cancel = self.inner.cancel.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !cancel.is_cancelled() {
                tracing::debug!("Close timeout elapsed; cancelling socket tasks");
                cancel.cancel();
            }
        });

        for result in futures::future::join_all(sends).await {
            if let Err(err) = result {
                tracing::warn!(?err, "Send task failed");
            }
        }

        if let Err(err) = self.inner.transport_write.lock().await.shutdown().await {
            tracing::debug!(?err, "Transport shutdown failed");
        }

        if let Some(receive) = receive {
            if let Err(err) = receive.await {
                tracing::warn!(?err, "Receive loop failed");
            }
        }
        deadline.abort();

        lock(&self.inner.transport_read).take();
        self.inner.complete_all_routes().await;
        tracing::debug!("Socket closed");
    }

    fn start_receive_loop(&self) {
        let Some(transport) = lock(&self.inner.transport_read).take() else {
            return;
        };
        let handle = tokio::spawn(receive_loop(Arc::clone(&self.inner), transport));
        lock(&self.inner.tasks).receive = Some(handle);
    }
}

async fn receive_loop(inner: Arc<SocketInner>, mut transport: TransportRead) {
    let cancel = inner.cancel.clone();
    let result = tokio::select! {
        () = cancel.cancelled() => Ok(()),
        result = inner.receive_frames(&mut transport) => result,
    };
    match result {
        Ok(()) => tracing::debug!("Receive loop finished"),
        Err(err) => tracing::warn!(%err, "Receive loop failed"),
    }
    inner.complete_all_routes().await;
}

async fn send_loop(inner: Arc<SocketInner>, channel_id: i32, mut reader: RingBufferReader) {
    let cancel = inner.cancel.clone();
    let result = tokio::select! {
        () = cancel.cancelled() => {
            tracing::debug!(channel_id, "Send task cancelled");
            Ok(())
        }
        result = inner.send_frames(channel_id, &mut reader) => result,
    };
    if let Err(err) = result {
        tracing::warn!(channel_id, %err, "Send task failed");
    }
}

impl SocketInner {
    async fn receive_frames(&self, transport: &mut TransportRead) -> SocketResult<()> {
        while let Some(header) = read_header(transport).await? {
            match header {
                FrameHeader::Detach { channel_id } => {
                    let route = lock(&self.routes).inbound.remove(&channel_id);
                    if let Some(route) = route {
                        route.lock().await.mark_complete();
                        tracing::trace!(channel_id, "Channel detached");
                    } else {
                        tracing::debug!(channel_id, "Detach for unknown channel");
                    }
                }
                FrameHeader::Data { channel_id, size } => {
                    let route = lock(&self.routes).inbound.get(&channel_id).cloned();
                    if let Some(route) = route {
                        self.copy_frame(transport, channel_id, &route, size).await?;
                    } else {
                        tracing::debug!(channel_id, size, "Dropping frame for unknown channel");
                        discard(transport, size).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy a frame payload straight from the transport into the routed buffer.
    async fn copy_frame(
        &self,
        transport: &mut TransportRead,
        channel_id: i32,
        route: &InboundRoute,
        size: usize,
    ) -> SocketResult<()> {
        let mut writer = route.lock().await;
        let mut remaining = size;
        while remaining > 0 {
            if let Err(err) = writer.wait_to_write(1).await {
                tracing::warn!(channel_id, %err, "Inbound buffer rejected data; dropping route");
                lock(&self.routes).inbound.remove(&channel_id);
                return Ok(discard(transport, remaining).await?);
            }
            let buffer = writer.write_buffer();
            let n = buffer.len().min(remaining);
            transport.read_exact(&mut buffer[..n]).await?;
            writer.advance_write_position(n);
            remaining -= n;
        }
        Ok(())
    }

    async fn send_frames(&self, channel_id: i32, reader: &mut RingBufferReader) -> SocketResult<()> {
        while reader.wait_to_read(1).await {
            let data = reader.read_buffer();
            let size = data.len().min(MAX_FRAME_PAYLOAD);
            let header = FrameHeader::Data { channel_id, size }.encode();
            {
                let mut transport = self.transport_write.lock().await;
                transport.write_all(&header).await?;
                transport.write_all(&data[..size]).await?;
                transport.flush().await?;
            }
            reader.advance_read_position(size);
        }

        let mut transport = self.transport_write.lock().await;
        transport
            .write_all(&FrameHeader::Detach { channel_id }.encode())
            .await?;
        transport.flush().await?;
        tracing::trace!(channel_id, "Sent detach");
        Ok(())
    }

    async fn complete_all_routes(&self) {
        let routes: Vec<(i32, InboundRoute)> = {
            let mut routes = lock(&self.routes);
            routes.closed = true;
            routes.inbound.drain().collect()
        };
        for (channel_id, route) in routes {
            route.lock().await.mark_complete();
            tracing::trace!(channel_id, "Completed inbound buffer");
        }
    }
}

async fn discard<R>(transport: &mut R, size: usize) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let expected = size as u64;
    let copied = tokio::io::copy(&mut (&mut *transport).take(expected), &mut tokio::io::sink()).await?;
    if copied < expected {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;

    fn frame(channel_id: i32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = FrameHeader::Data {
            channel_id,
            size: payload.len(),
        }
        .encode()
        .to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn small() -> BufferOptions {
        BufferOptions::default().chunk_length(64)
    }

    fn pair() -> (ComputeSocket, ComputeSocket) {
        let (a, b) = tokio::io::duplex(4096);
        (ComputeSocket::new(a), ComputeSocket::new(b))
    }

    fn raw() -> (DuplexStream, ComputeSocket) {
        let (raw, transport) = tokio::io::duplex(4096);
        (raw, ComputeSocket::new(transport))
    }

    async fn read_to_end(reader: &mut RingBufferReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = reader.read_some(&mut buf).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_interleaved_frames_are_demultiplexed() {
        let (mut raw, socket) = raw();
        let mut one = socket.create_channel(1, small()).unwrap();
        let mut two = socket.create_channel(2, small()).unwrap();

        for (channel_id, payload) in [(1, b"A"), (2, b"X"), (1, b"B"), (2, b"Y")] {
            raw.write_all(&frame(channel_id, payload)).await.unwrap();
        }
        raw.shutdown().await.unwrap();

        assert_eq!(read_to_end(one.reader()).await, b"AB");
        assert_eq!(read_to_end(two.reader()).await, b"XY");
    }

    #[tokio::test]
    async fn test_detach_completes_after_drain() {
        let (mut raw, socket) = raw();
        let mut channel = socket.create_channel(3, small()).unwrap();

        raw.write_all(&frame(3, b"hello")).await.unwrap();
        raw.write_all(&FrameHeader::Detach { channel_id: 3 }.encode())
            .await
            .unwrap();

        let reader = channel.reader();
        assert!(reader.wait_to_read(5).await);
        assert!(!reader.is_complete());
        let mut buf = [0u8; 5];
        assert!(reader.read_exact(&mut buf).await);
        assert_eq!(&buf, b"hello");
        assert!(!reader.wait_to_read(1).await);
        assert!(reader.is_complete());
    }

    #[tokio::test]
    async fn test_unknown_channel_is_skipped() {
        let (mut raw, socket) = raw();
        let mut channel = socket.create_channel(1, small()).unwrap();

        raw.write_all(&frame(9, b"ignored")).await.unwrap();
        raw.write_all(&frame(1, b"kept")).await.unwrap();
        raw.shutdown().await.unwrap();

        assert_eq!(read_to_end(channel.reader()).await, b"kept");
    }

    #[tokio::test]
    async fn test_frames_larger_than_a_chunk() {
        let (mut raw, socket) = raw();
        let mut channel = socket.create_channel(1, small()).unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let expected = payload.clone();
        let reading = tokio::spawn(async move { read_to_end(channel.reader()).await });
        raw.write_all(&frame(1, &payload)).await.unwrap();
        raw.shutdown().await.unwrap();

        assert_eq!(reading.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_socket_pair_round_trip() {
        let (a, b) = pair();
        let mut near = a.create_channel(5, small()).unwrap();
        let mut far = b.create_channel(5, small()).unwrap();

        near.writer().write(b"ping").await.unwrap();
        near.close();
        assert_eq!(read_to_end(far.reader()).await, b"ping");

        far.writer().write(b"pong").await.unwrap();
        far.close();
        assert_eq!(read_to_end(near.reader()).await, b"pong");
    }

    #[tokio::test]
    async fn test_duplicate_route_is_rejected() {
        let (_raw, socket) = raw();
        let _channel = socket.create_channel(1, small()).unwrap();
        assert!(matches!(
            socket.create_channel(1, small()),
            Err(SocketError::ChannelInUse(1))
        ));
    }

    #[tokio::test]
    async fn test_close_completes_peer_and_later_routes() {
        let (a, b) = pair();
        let mut near = a.create_channel(1, small()).unwrap();
        let mut far = b.create_channel(1, small()).unwrap();

        near.writer().write(b"bye").await.unwrap();
        near.close();
        a.close_with_timeout(Duration::from_millis(200)).await;

        assert_eq!(read_to_end(far.reader()).await, b"bye");
        assert!(a.is_closed());

        let late = RingBuffer::with_options(small()).unwrap();
        let mut late_reader = late.create_reader().unwrap();
        a.attach_recv_buffer(2, late.create_writer().unwrap()).unwrap();
        assert!(!late_reader.wait_to_read(1).await);
        assert!(matches!(
            a.create_channel(3, small()),
            Err(SocketError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_nested_socket_over_channel() {
        let (a, b) = pair();
        let outer_near = a.create_channel(1, small()).unwrap();
        let outer_far = b.create_channel(1, small()).unwrap();

        let nested_a = ComputeSocket::new(outer_near.into_stream());
        let nested_b = ComputeSocket::new(outer_far.into_stream());
        let mut near = nested_a.create_channel(7, small()).unwrap();
        let mut far = nested_b.create_channel(7, small()).unwrap();

        near.writer().write(b"through two sockets").await.unwrap();
        near.close();
        assert_eq!(read_to_end(far.reader()).await, b"through two sockets");
    }
}
