//! Channel-multiplexing socket for remote compute.
//!
//! Provides:
//! - Frame codec (`i32 channel_id, i32 size` headers, detach sentinel)
//! - `ComputeSocket` - many ring-buffer channels over one duplex stream
//! - `ComputeChannel` - the local ends of one channel, optionally as a stream
//! - Worker handshake for processes that open their own socket

pub mod channel;
pub mod error;
pub mod frame;
pub mod socket;
pub mod worker;

pub use channel::ComputeChannel;
pub use error::{SocketError, SocketResult};
pub use frame::{DETACH, FRAME_HEADER_LEN, FrameHeader};
pub use socket::{ComputeSocket, DEFAULT_CLOSE_TIMEOUT, SocketConfig};
pub use worker::{WORKER_IPC_ENV_VAR, WorkerBridge, connect, connect_from_env};
