//! Initiator-side client for a compute agent.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use compute_buffer::BufferOptions;
use compute_core::{BlobLocator, ExecuteRequest};
use compute_transport::ComputeSocket;

use crate::{
    catalog::{
        Attach, DeleteFiles, Execute, Fork, ReadBlob, ReadBlobResponse, WriteFiles,
        WriteFilesResponse, XorRequest, XorResponse,
    },
    channel::MessageChannel,
    error::{ProtocolError, ProtocolResult},
    message::MessageType,
    process::ManagedProcess,
};

/// Issues requests to the agent serving one channel.
///
/// Requests on one client are sequential: each waits for its own reply.
/// Use [`fork`](Self::fork) for concurrent work.
#[derive(Debug, Clone)]
pub struct ComputeClient {
    socket: ComputeSocket,
    channel: Arc<MessageChannel>,
}

impl ComputeClient {
    /// Wrap an open message channel on `socket`.
    #[must_use]
    pub fn new(socket: ComputeSocket, channel: MessageChannel) -> Self {
        Self {
            socket,
            channel: Arc::new(channel),
        }
    }

    /// Open `channel_id` on `socket` and wrap it.
    ///
    /// # Errors
    /// Returns a socket error if the channel cannot be created.
    pub fn connect(
        socket: &ComputeSocket,
        channel_id: i32,
        options: BufferOptions,
    ) -> ProtocolResult<Self> {
        let channel = socket.create_channel(channel_id, options)?;
        Ok(Self::new(socket.clone(), MessageChannel::new(channel)))
    }

    /// The underlying message channel.
    #[must_use]
    pub const fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    /// Ask the agent to serve a new channel.
    ///
    /// A `buffer_size` of 0 uses the default buffer geometry on both ends.
    /// The local end is attached before the request is sent. Call
    /// [`wait_for_attach`](Self::wait_for_attach) on the returned client
    /// before sending requests on it.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if `buffer_size` does not fit the wire field,
    /// or a socket or buffer error.
    pub async fn fork(&self, channel_id: i32, buffer_size: usize) -> ProtocolResult<Self> {
        let wire_size = i32::try_from(buffer_size)
            .map_err(|_| ProtocolError::InvalidRequest(format!("buffer size {buffer_size}")))?;
        let options = if buffer_size == 0 {
            BufferOptions::default()
        } else {
            BufferOptions::with_capacity(buffer_size)
        };
        let forked = Self::connect(&self.socket, channel_id, options)?;
        self.channel
            .send(&Fork {
                channel_id,
                buffer_size: wire_size,
            })
            .await?;
        tracing::debug!(channel_id, buffer_size, "Requested fork");
        Ok(forked)
    }

    /// Wait until the agent serves this channel.
    ///
    /// # Errors
    /// Returns `UnexpectedMessage`, `Remote` or `ChannelClosed`.
    pub async fn wait_for_attach(&self) -> ProtocolResult<()> {
        self.channel.receive_as::<Attach>().await.map(|_| ())
    }

    /// Materialize the tree at `tree` under `target_dir` in the sandbox.
    ///
    /// # Errors
    /// Returns `Remote` if the agent rejected or failed the write.
    pub async fn write_files(&self, target_dir: &str, tree: &BlobLocator) -> ProtocolResult<()> {
        self.channel
            .send(&WriteFiles {
                target_dir: target_dir.to_string(),
                tree: tree.clone(),
            })
            .await?;
        self.channel
            .receive_as::<WriteFilesResponse>()
            .await
            .map(|_| ())
    }

    /// Delete sandbox files matching `filters`.
    ///
    /// The agent does not acknowledge deletes; a failure arrives as an
    /// exception in reply to the next request.
    ///
    /// # Errors
    /// Returns a buffer error if the request cannot be sent.
    pub async fn delete_files<I>(&self, filters: I) -> ProtocolResult<()>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let filters = filters.into_iter().map(Into::into).collect();
        self.channel.send(&DeleteFiles { filters }).await
    }

    /// Start a process.
    ///
    /// The returned handle owns this channel's inbound messages until the
    /// process finishes.
    ///
    /// # Errors
    /// Returns a buffer error if the request cannot be sent.
    pub async fn execute(&self, request: ExecuteRequest) -> ProtocolResult<ManagedProcess> {
        tracing::debug!(
            channel_id = self.channel.id(),
            executable = %request.executable,
            "Executing remote process"
        );
        self.channel.send(&Execute(request)).await?;
        Ok(ManagedProcess::spawn(Arc::clone(&self.channel)))
    }

    /// Read a blob range from the agent's storage, reassembling chunks.
    ///
    /// `offset == 0 && length == 0` reads the whole blob.
    ///
    /// # Errors
    /// Returns `Remote` if the agent failed the read, or `Malformed` if the
    /// chunks do not line up.
    pub async fn read_blob(
        &self,
        locator: &BlobLocator,
        offset: i32,
        length: i32,
    ) -> ProtocolResult<Bytes> {
        self.channel
            .send(&ReadBlob {
                locator: locator.clone(),
                offset,
                length,
            })
            .await?;

        let mut data = BytesMut::new();
        loop {
            let chunk = self.channel.receive_as::<ReadBlobResponse>().await?;
            let total = usize::try_from(chunk.total_length).map_err(|_| {
                ProtocolError::malformed(
                    MessageType::ReadBlobResponse,
                    format!("negative total length {}", chunk.total_length),
                )
            })?;
            if usize::try_from(chunk.chunk_offset).ok() != Some(data.len()) {
                return Err(ProtocolError::malformed(
                    MessageType::ReadBlobResponse,
                    format!("chunk at {} after {} bytes", chunk.chunk_offset, data.len()),
                ));
            }
            data.extend_from_slice(&chunk.data);
            if data.len() >= total {
                return Ok(data.freeze());
            }
        }
    }

    /// Xor every byte of `data` with `value` on the agent.
    ///
    /// # Errors
    /// Returns `Remote` or `UnexpectedMessage`.
    pub async fn xor(&self, value: u8, data: impl Into<Bytes>) -> ProtocolResult<Bytes> {
        self.channel
            .send(&XorRequest {
                value,
                data: data.into(),
            })
            .await?;
        Ok(self.channel.receive_as::<XorResponse>().await?.data)
    }

    /// Finish the channel. The agent's handler for it exits once it drains.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}
