//! Remote compute protocol.
//!
//! Provides:
//! - Message framing (`u8 type, i32 length` headers) over socket channels
//! - The typed message catalog
//! - `ComputeClient` and `ManagedProcess` for the initiator
//! - `ComputeHandler`, the agent-side dispatcher

pub mod agent;
pub mod catalog;
pub mod channel;
pub mod client;
pub mod error;
pub mod message;
pub mod process;

pub use agent::{AgentConfig, ComputeHandler, MAX_BLOB_CHUNK, ROOT_CHANNEL_ID};
pub use catalog::{MessageBody, TypedMessage};
pub use channel::{MessageBuilder, MessageChannel};
pub use client::ComputeClient;
pub use error::{ProcessError, ProtocolError, ProtocolResult};
pub use message::{Message, MessageType};
pub use process::{LineSplitter, ManagedProcess};
