//! Agent-side dispatch of compute requests.
//!
//! One [`ComputeHandler`] serves a channel; every `Fork` starts another
//! handler on a new channel of the same socket. Requests that fail are
//! reported to the initiator as an `Exception` and the channel keeps being
//! served. Channel faults end the handler.

mod blob;
mod execute;
mod files;

use std::{path::PathBuf, sync::Arc};

use compute_buffer::BufferOptions;
use compute_core::{BlobStorage, ProcessLauncher};
use compute_transport::{ComputeSocket, SocketError};
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use blob::MAX_BLOB_CHUNK;

use crate::{
    catalog::{Attach, Exception, Execute, Fork, TypedMessage},
    channel::MessageChannel,
    error::{ProtocolError, ProtocolResult},
};

/// Channel the initiator and agent open on every new socket.
pub const ROOT_CHANNEL_ID: i32 = 0;

/// Default size of each `ExecuteOutput` chunk.
pub const DEFAULT_OUTPUT_CHUNK_SIZE: usize = 16 * 1024;

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Root directory all file operations and processes are confined to.
    pub sandbox: PathBuf,
    /// Buffer geometry for channels the agent opens itself.
    pub channel_options: BufferOptions,
    /// Largest `ExecuteOutput` payload.
    pub output_chunk_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sandbox: PathBuf::from("sandbox"),
            channel_options: BufferOptions::default(),
            output_chunk_size: DEFAULT_OUTPUT_CHUNK_SIZE,
        }
    }
}

impl AgentConfig {
    /// Configuration rooted at `sandbox`.
    #[must_use]
    pub fn new(sandbox: impl Into<PathBuf>) -> Self {
        Self {
            sandbox: sandbox.into(),
            ..Self::default()
        }
    }
}

/// Map a socket error raised while serving one request. Only a closed or
/// broken socket faults the channel.
fn request_error(err: SocketError) -> ProtocolError {
    match err {
        SocketError::ChannelInUse(id) => {
            ProtocolError::InvalidRequest(format!("channel {id} is already in use"))
        }
        SocketError::Io(err) => ProtocolError::Io(err),
        other => other.into(),
    }
}

/// Serves compute requests arriving on a socket's channels.
#[derive(Clone)]
pub struct ComputeHandler {
    socket: ComputeSocket,
    storage: Arc<dyn BlobStorage>,
    launcher: Arc<dyn ProcessLauncher>,
    config: Arc<AgentConfig>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ComputeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeHandler")
            .field("socket", &self.socket)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ComputeHandler {
    /// Create a handler for channels of `socket`.
    #[must_use]
    pub fn new(
        socket: ComputeSocket,
        storage: Arc<dyn BlobStorage>,
        launcher: Arc<dyn ProcessLauncher>,
        config: AgentConfig,
    ) -> Self {
        Self {
            socket,
            storage,
            launcher,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop when `cancel` fires. Forked handlers share the token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Agent configuration.
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Open the root channel now and return the future serving it.
    ///
    /// Call this before the peer can send: frames for a channel that is not
    /// open yet are discarded.
    ///
    /// # Errors
    /// Returns a socket error if the root channel cannot be opened.
    pub fn serve_root(self) -> ProtocolResult<BoxFuture<'static, ProtocolResult<()>>> {
        let channel = self
            .socket
            .create_channel(ROOT_CHANNEL_ID, self.config.channel_options)?;
        Ok(self.serve(MessageChannel::new(channel)))
    }

    /// Serve `channel` until the initiator closes it, a channel fault
    /// occurs, or the handler is cancelled. Waits for forked handlers.
    pub fn serve(self, channel: MessageChannel) -> BoxFuture<'static, ProtocolResult<()>> {
        Box::pin(self.dispatch(channel))
    }

    async fn dispatch(self, channel: MessageChannel) -> ProtocolResult<()> {
        let channel_id = channel.id();
        let mut forks = JoinSet::new();
        tracing::debug!(channel_id, "Serving channel");

        let result = loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => break Err(ProtocolError::Cancelled),
                received = channel.receive() => received,
            };
            let request = match received.and_then(|message| TypedMessage::parse(&message)) {
                Ok(TypedMessage::None) => break Ok(()),
                Ok(request) => request,
                Err(err) => break Err(err),
            };
            tracing::trace!(channel_id, message_type = ?request.message_type(), "Dispatching");

            let outcome = match request {
                TypedMessage::Fork(fork) => self.fork(fork, &mut forks),
                TypedMessage::WriteFiles(request) => self.write_files(&channel, request).await,
                TypedMessage::DeleteFiles(request) => self.delete_files(request).await,
                TypedMessage::Execute(Execute(request)) => self.execute(&channel, request).await,
                TypedMessage::ReadBlob(request) => self.read_blob(&channel, request).await,
                TypedMessage::XorRequest(request) => channel.send(&request.apply()).await,
                other => Err(ProtocolError::UnexpectedMessage {
                    expected: "a request",
                    actual: other.message_type(),
                }),
            };

            if let Err(err) = outcome {
                if err.is_channel_fault() {
                    break Err(err);
                }
                tracing::warn!(channel_id, %err, "Request failed");
                if let Err(err) = channel.send(&Exception::from_error(&err)).await {
                    break Err(err);
                }
            }
        };

        if let Err(err @ (ProtocolError::UnexpectedMessage { .. } | ProtocolError::Malformed { .. })) =
            &result
        {
            tracing::warn!(channel_id, %err, "Protocol fault; closing channel");
            let _ = channel.send(&Exception::from_error(err)).await;
        }
        channel.close().await;

        while let Some(joined) = forks.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(channel_id, %err, "Forked handler panicked");
            }
        }

        match &result {
            Ok(()) => tracing::debug!(channel_id, "Channel finished"),
            Err(ProtocolError::Cancelled) => tracing::debug!(channel_id, "Channel cancelled"),
            Err(err) => tracing::warn!(channel_id, %err, "Channel failed"),
        }
        result
    }

    fn fork(&self, fork: Fork, forks: &mut JoinSet<()>) -> ProtocolResult<()> {
        let options = match usize::try_from(fork.buffer_size) {
            Ok(size) if size > 0 => BufferOptions::with_capacity(size),
            _ => self.config.channel_options,
        };
        let channel = self
            .socket
            .create_channel(fork.channel_id, options)
            .map_err(request_error)?;

        let handler = self.clone();
        forks.spawn(async move {
            let channel = MessageChannel::new(channel);
            let channel_id = channel.id();
            if let Err(err) = channel.send(&Attach).await {
                tracing::warn!(channel_id, %err, "Failed to attach forked channel");
                return;
            }
            // Errors are logged by the forked handler itself.
            let _ = handler.serve(channel).await;
        });
        tracing::debug!(channel_id = fork.channel_id, "Forked channel");
        Ok(())
    }
}
