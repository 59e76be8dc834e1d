//! Protocol errors.

use compute_buffer::BufferError;
use compute_core::{LaunchError, SandboxViolation, StorageError};
use compute_storage::TreeError;
use compute_transport::SocketError;
use thiserror::Error;

use crate::message::MessageType;

/// Result type for protocol operations.
pub type ProtocolResult<T, E = ProtocolError> = Result<T, E>;

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unexpected {actual:?} message, expected {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: MessageType,
    },
    #[error("Malformed {message_type:?} message: {reason}")]
    Malformed {
        message_type: MessageType,
        reason: String,
    },
    #[error("Remote exception: {message}")]
    Remote { message: String, trace: String },
    #[error("A message is already being built on this channel")]
    BuilderInUse,
    #[error("Message payload of {0} bytes is too large")]
    MessageTooLarge(usize),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    SandboxViolation(#[from] SandboxViolation),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(message_type: MessageType, reason: impl Into<String>) -> Self {
        Self::Malformed {
            message_type,
            reason: reason.into(),
        }
    }

    /// Whether the error breaks the channel itself rather than one request.
    ///
    /// The agent reports other errors to the initiator as an exception and
    /// keeps serving the channel.
    #[must_use]
    pub const fn is_channel_fault(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedMessage { .. }
                | Self::Malformed { .. }
                | Self::BuilderInUse
                | Self::Cancelled
                | Self::ChannelClosed
                | Self::Buffer(_)
                | Self::Socket(_)
        )
    }
}

impl From<TreeError> for ProtocolError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::Sandbox(violation) => Self::SandboxViolation(violation),
            TreeError::Storage(err) => Self::Storage(err),
            TreeError::Io { path, source } => Self::Io(std::io::Error::new(
                source.kind(),
                format!("{}: {source}", path.display()),
            )),
            TreeError::InvalidName(name) => {
                Self::InvalidRequest(format!("invalid directory entry name {name:?}"))
            }
        }
    }
}

/// Terminal failure of a [`ManagedProcess`](crate::ManagedProcess).
///
/// Observed by both the line queue and the exit code, so it is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("Remote exception: {message}")]
    Remote { message: String, trace: String },
    #[error("Unexpected {0:?} message while relaying process output")]
    UnexpectedMessage(MessageType),
    #[error("Malformed message while relaying process output: {0}")]
    Malformed(String),
    #[error("Channel closed before the process exited")]
    ChannelClosed,
}

impl From<ProcessError> for ProtocolError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Remote { message, trace } => Self::Remote { message, trace },
            ProcessError::UnexpectedMessage(actual) => Self::UnexpectedMessage {
                expected: "ExecuteOutput or ExecuteResult",
                actual,
            },
            ProcessError::Malformed(reason) => Self::Malformed {
                message_type: MessageType::ExecuteOutput,
                reason,
            },
            ProcessError::ChannelClosed => Self::ChannelClosed,
        }
    }
}
