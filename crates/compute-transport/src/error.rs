//! Socket errors.

use compute_buffer::BufferError;
use thiserror::Error;

/// Result type for socket operations.
pub type SocketResult<T, E = SocketError> = Result<T, E>;

/// Socket error.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("Channel {0} already has an inbound route")]
    ChannelInUse(i32),
    #[error("Frame for channel {channel_id} has invalid size {size}")]
    MalformedFrame { channel_id: i32, size: i32 },
    #[error("Socket is closed")]
    Closed,
    #[error("{0} is not set")]
    MissingWorkerAddress(&'static str),
}
