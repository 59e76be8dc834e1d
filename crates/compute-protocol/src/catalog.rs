//! Typed message catalog.
//!
//! Each message kind is a struct implementing [`MessageBody`], which pairs
//! the wire tag with a payload encoder and decoder. [`TypedMessage`] is the
//! sum of all kinds, used by dispatchers.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use compute_core::{BlobLocator, ExecuteRequest};

use crate::{
    error::{ProtocolError, ProtocolResult},
    message::{Message, MessageType, PayloadReader, PayloadWriter},
};

/// A message kind with a fixed tag and payload layout.
pub trait MessageBody: Sized {
    /// Wire tag.
    const TYPE: MessageType;

    /// Append the payload to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decode the payload.
    ///
    /// # Errors
    /// Returns `Malformed` if the payload does not match the layout.
    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self>;

    /// Expected payload size, used to size builders.
    fn size_hint(&self) -> usize {
        64
    }

    /// Parse a received message as this kind.
    ///
    /// An `Exception` message is surfaced as a `Remote` error.
    ///
    /// # Errors
    /// Returns `Remote`, `UnexpectedMessage` or `Malformed`.
    fn parse(message: &Message) -> ProtocolResult<Self> {
        match message.message_type() {
            t if t == Self::TYPE => Self::decode(&mut message.reader()),
            MessageType::Exception => Err(Exception::parse(message)?.into()),
            actual => Err(ProtocolError::UnexpectedMessage {
                expected: std::any::type_name::<Self>()
                    .rsplit("::")
                    .next()
                    .unwrap_or("message"),
                actual,
            }),
        }
    }

    /// Encode into a standalone message.
    fn build(&self) -> Message {
        let mut buf = BytesMut::with_capacity(self.size_hint());
        self.encode(&mut buf);
        Message::new(Self::TYPE, buf.freeze())
    }
}

/// An error raised on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub message: String,
    pub trace: String,
}

impl Exception {
    /// Describe `err`, with its chain of sources as the trace.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            trace: trace.join("\n"),
        }
    }
}

impl From<Exception> for ProtocolError {
    fn from(exception: Exception) -> Self {
        Self::Remote {
            message: exception.message,
            trace: exception.trace,
        }
    }
}

impl MessageBody for Exception {
    const TYPE: MessageType = MessageType::Exception;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_string(&self.message);
        buf.put_string(&self.trace);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            message: reader.read_string()?,
            trace: reader.read_string()?,
        })
    }

    fn size_hint(&self) -> usize {
        8 + self.message.len() + self.trace.len()
    }

    fn parse(message: &Message) -> ProtocolResult<Self> {
        if message.message_type() != MessageType::Exception {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "Exception",
                actual: message.message_type(),
            });
        }
        Self::decode(&mut message.reader())
    }
}

/// Open a new channel on the socket, served by its own handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fork {
    pub channel_id: i32,
    /// Capacity of each of the new channel's buffers.
    pub buffer_size: i32,
}

impl MessageBody for Fork {
    const TYPE: MessageType = MessageType::Fork;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.channel_id);
        buf.put_i32_le(self.buffer_size);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            channel_id: reader.read_i32()?,
            buffer_size: reader.read_i32()?,
        })
    }

    fn size_hint(&self) -> usize {
        8
    }
}

/// Sent by the agent once a forked channel is being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attach;

impl MessageBody for Attach {
    const TYPE: MessageType = MessageType::Attach;

    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(_reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self)
    }

    fn size_hint(&self) -> usize {
        0
    }
}

/// Materialize a stored directory tree under the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFiles {
    /// Target directory, relative to the sandbox root.
    pub target_dir: String,
    /// Root node of the tree.
    pub tree: BlobLocator,
}

impl MessageBody for WriteFiles {
    const TYPE: MessageType = MessageType::WriteFiles;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_string(&self.target_dir);
        buf.put_string(self.tree.as_str());
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            target_dir: reader.read_string()?,
            tree: BlobLocator::new(reader.read_string()?),
        })
    }

    fn size_hint(&self) -> usize {
        8 + self.target_dir.len() + self.tree.as_str().len()
    }
}

/// Acknowledges [`WriteFiles`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFilesResponse;

impl MessageBody for WriteFilesResponse {
    const TYPE: MessageType = MessageType::WriteFilesResponse;

    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(_reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self)
    }

    fn size_hint(&self) -> usize {
        0
    }
}

/// Delete sandbox files matching glob patterns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteFiles {
    /// Patterns relative to the sandbox root.
    pub filters: Vec<String>,
}

impl MessageBody for DeleteFiles {
    const TYPE: MessageType = MessageType::DeleteFiles;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_count(self.filters.len());
        for filter in &self.filters {
            buf.put_string(filter);
        }
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        let count = reader.read_count()?;
        let filters = (0..count)
            .map(|_| reader.read_string())
            .collect::<ProtocolResult<_>>()?;
        Ok(Self { filters })
    }
}

/// Run a process in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute(pub ExecuteRequest);

impl MessageBody for Execute {
    const TYPE: MessageType = MessageType::Execute;

    fn encode(&self, buf: &mut BytesMut) {
        let request = &self.0;
        buf.put_string(&request.executable);
        buf.put_count(request.arguments.len());
        for argument in &request.arguments {
            buf.put_string(argument);
        }
        buf.put_option_string(request.working_dir.as_deref());
        buf.put_count(request.env.len());
        for (name, value) in &request.env {
            buf.put_string(name);
            buf.put_option_string(value.as_deref());
        }
        buf.put_u32_le(request.flags);
        buf.put_option_i32(request.worker_channel);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        let executable = reader.read_string()?;
        let count = reader.read_count()?;
        let arguments = (0..count)
            .map(|_| reader.read_string())
            .collect::<ProtocolResult<_>>()?;
        let working_dir = reader.read_option_string()?;
        let count = reader.read_count()?;
        let mut env = BTreeMap::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let value = reader.read_option_string()?;
            env.insert(name, value);
        }
        let flags = reader.read_u32()?;
        let worker_channel = reader.read_option_i32()?;
        Ok(Self(ExecuteRequest {
            executable,
            arguments,
            working_dir,
            env,
            flags,
            worker_channel,
        }))
    }

    fn size_hint(&self) -> usize {
        256
    }
}

/// A chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOutput {
    pub data: Bytes,
}

impl MessageBody for ExecuteOutput {
    const TYPE: MessageType = MessageType::ExecuteOutput;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            data: Bytes::copy_from_slice(reader.remaining()),
        })
    }

    fn size_hint(&self) -> usize {
        self.data.len()
    }
}

/// Process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResult {
    pub exit_code: i32,
}

impl MessageBody for ExecuteResult {
    const TYPE: MessageType = MessageType::ExecuteResult;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.exit_code);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            exit_code: reader.read_i32()?,
        })
    }

    fn size_hint(&self) -> usize {
        4
    }
}

/// Read a range of a stored blob.
///
/// `offset == 0 && length == 0` requests the whole blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlob {
    pub locator: BlobLocator,
    pub offset: i32,
    pub length: i32,
}

impl ReadBlob {
    /// Request the whole blob.
    #[must_use]
    pub const fn whole(locator: BlobLocator) -> Self {
        Self {
            locator,
            offset: 0,
            length: 0,
        }
    }

    /// Whether this is the whole-blob request.
    #[must_use]
    pub const fn is_whole(&self) -> bool {
        self.offset == 0 && self.length == 0
    }
}

impl MessageBody for ReadBlob {
    const TYPE: MessageType = MessageType::ReadBlob;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_string(self.locator.as_str());
        buf.put_i32_le(self.offset);
        buf.put_i32_le(self.length);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            locator: BlobLocator::new(reader.read_string()?),
            offset: reader.read_i32()?,
            length: reader.read_i32()?,
        })
    }
}

/// One chunk of a [`ReadBlob`] reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlobResponse {
    /// Offset of `data` within the returned range.
    pub chunk_offset: i32,
    /// Length of the whole returned range.
    pub total_length: i32,
    pub data: Bytes,
}

impl MessageBody for ReadBlobResponse {
    const TYPE: MessageType = MessageType::ReadBlobResponse;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.chunk_offset);
        buf.put_i32_le(self.total_length);
        buf.put_slice(&self.data);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            chunk_offset: reader.read_i32()?,
            total_length: reader.read_i32()?,
            data: Bytes::copy_from_slice(reader.remaining()),
        })
    }

    fn size_hint(&self) -> usize {
        8 + self.data.len()
    }
}

/// Echo request: the agent replies with every byte xor'ed with `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorRequest {
    pub value: u8,
    pub data: Bytes,
}

impl XorRequest {
    /// The expected reply.
    #[must_use]
    pub fn apply(&self) -> XorResponse {
        XorResponse {
            data: self.data.iter().map(|b| b ^ self.value).collect(),
        }
    }
}

impl MessageBody for XorRequest {
    const TYPE: MessageType = MessageType::XorRequest;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.value);
        buf.put_slice(&self.data);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            value: reader.read_u8()?,
            data: Bytes::copy_from_slice(reader.remaining()),
        })
    }

    fn size_hint(&self) -> usize {
        1 + self.data.len()
    }
}

/// Reply to [`XorRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorResponse {
    pub data: Bytes,
}

impl MessageBody for XorResponse {
    const TYPE: MessageType = MessageType::XorResponse;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }

    fn decode(reader: &mut PayloadReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            data: Bytes::copy_from_slice(reader.remaining()),
        })
    }

    fn size_hint(&self) -> usize {
        self.data.len()
    }
}

/// Any catalog message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedMessage {
    None,
    Exception(Exception),
    Fork(Fork),
    Attach(Attach),
    WriteFiles(WriteFiles),
    WriteFilesResponse(WriteFilesResponse),
    DeleteFiles(DeleteFiles),
    Execute(Execute),
    ExecuteOutput(ExecuteOutput),
    ExecuteResult(ExecuteResult),
    ReadBlob(ReadBlob),
    ReadBlobResponse(ReadBlobResponse),
    XorRequest(XorRequest),
    XorResponse(XorResponse),
}

impl TypedMessage {
    /// Decode any known message.
    ///
    /// # Errors
    /// Returns `UnexpectedMessage` for unknown tags, or `Malformed`.
    pub fn parse(message: &Message) -> ProtocolResult<Self> {
        let reader = &mut message.reader();
        Ok(match message.message_type() {
            MessageType::None => Self::None,
            MessageType::Exception => Self::Exception(Exception::decode(reader)?),
            MessageType::Fork => Self::Fork(Fork::decode(reader)?),
            MessageType::Attach => Self::Attach(Attach::decode(reader)?),
            MessageType::WriteFiles => Self::WriteFiles(WriteFiles::decode(reader)?),
            MessageType::WriteFilesResponse => {
                Self::WriteFilesResponse(WriteFilesResponse::decode(reader)?)
            }
            MessageType::DeleteFiles => Self::DeleteFiles(DeleteFiles::decode(reader)?),
            MessageType::Execute => Self::Execute(Execute::decode(reader)?),
            MessageType::ExecuteOutput => Self::ExecuteOutput(ExecuteOutput::decode(reader)?),
            MessageType::ExecuteResult => Self::ExecuteResult(ExecuteResult::decode(reader)?),
            MessageType::ReadBlob => Self::ReadBlob(ReadBlob::decode(reader)?),
            MessageType::ReadBlobResponse => {
                Self::ReadBlobResponse(ReadBlobResponse::decode(reader)?)
            }
            MessageType::XorRequest => Self::XorRequest(XorRequest::decode(reader)?),
            MessageType::XorResponse => Self::XorResponse(XorResponse::decode(reader)?),
            actual @ MessageType::Unknown(_) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "a known message type",
                    actual,
                });
            }
        })
    }

    /// Tag of the contained message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::None => MessageType::None,
            Self::Exception(_) => Exception::TYPE,
            Self::Fork(_) => Fork::TYPE,
            Self::Attach(_) => Attach::TYPE,
            Self::WriteFiles(_) => WriteFiles::TYPE,
            Self::WriteFilesResponse(_) => WriteFilesResponse::TYPE,
            Self::DeleteFiles(_) => DeleteFiles::TYPE,
            Self::Execute(_) => Execute::TYPE,
            Self::ExecuteOutput(_) => ExecuteOutput::TYPE,
            Self::ExecuteResult(_) => ExecuteResult::TYPE,
            Self::ReadBlob(_) => ReadBlob::TYPE,
            Self::ReadBlobResponse(_) => ReadBlobResponse::TYPE,
            Self::XorRequest(_) => XorRequest::TYPE,
            Self::XorResponse(_) => XorResponse::TYPE,
        }
    }

    /// Encode into a standalone message.
    #[must_use]
    pub fn build(&self) -> Message {
        match self {
            Self::None => Message::none(),
            Self::Exception(m) => m.build(),
            Self::Fork(m) => m.build(),
            Self::Attach(m) => m.build(),
            Self::WriteFiles(m) => m.build(),
            Self::WriteFilesResponse(m) => m.build(),
            Self::DeleteFiles(m) => m.build(),
            Self::Execute(m) => m.build(),
            Self::ExecuteOutput(m) => m.build(),
            Self::ExecuteResult(m) => m.build(),
            Self::ReadBlob(m) => m.build(),
            Self::ReadBlobResponse(m) => m.build(),
            Self::XorRequest(m) => m.build(),
            Self::XorResponse(m) => m.build(),
        }
    }
}
