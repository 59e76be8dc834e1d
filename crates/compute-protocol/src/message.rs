//! Message framing and payload primitives.
//!
//! A message is `u8 type, i32 length (LE), length bytes payload`. Payload
//! fields use little-endian integers, `u32`-length-prefixed UTF-8 strings,
//! `u8` presence flags for optional values and `u32`-counted lists.

use bytes::{BufMut, Bytes};

use crate::error::{ProtocolError, ProtocolResult};

/// Length of the message header.
pub const MESSAGE_HEADER_LEN: usize = 5;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// End of the channel.
    None,
    Exception,
    Fork,
    Attach,
    WriteFiles,
    WriteFilesResponse,
    DeleteFiles,
    Execute,
    ExecuteOutput,
    ExecuteResult,
    ReadBlob,
    ReadBlobResponse,
    XorRequest,
    XorResponse,
    /// A tag this build does not know.
    Unknown(u8),
}

impl MessageType {
    /// Wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::Exception => 0x02,
            Self::Fork => 0x03,
            Self::Attach => 0x04,
            Self::WriteFiles => 0x10,
            Self::WriteFilesResponse => 0x11,
            Self::DeleteFiles => 0x12,
            Self::Execute => 0x16,
            Self::ExecuteOutput => 0x17,
            Self::ExecuteResult => 0x18,
            Self::ReadBlob => 0x20,
            Self::ReadBlobResponse => 0x21,
            Self::XorRequest => 0xf0,
            Self::XorResponse => 0xf1,
            Self::Unknown(tag) => tag,
        }
    }

    /// Decode a wire tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Self {
        match tag {
            0x00 => Self::None,
            0x02 => Self::Exception,
            0x03 => Self::Fork,
            0x04 => Self::Attach,
            0x10 => Self::WriteFiles,
            0x11 => Self::WriteFilesResponse,
            0x12 => Self::DeleteFiles,
            0x16 => Self::Execute,
            0x17 => Self::ExecuteOutput,
            0x18 => Self::ExecuteResult,
            0x20 => Self::ReadBlob,
            0x21 => Self::ReadBlobResponse,
            0xf0 => Self::XorRequest,
            0xf1 => Self::XorResponse,
            other => Self::Unknown(other),
        }
    }
}

impl From<u8> for MessageType {
    fn from(tag: u8) -> Self {
        Self::from_tag(tag)
    }
}

impl From<MessageType> for u8 {
    fn from(message_type: MessageType) -> Self {
        message_type.tag()
    }
}

/// A received message, owning a copy of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    message_type: MessageType,
    payload: Bytes,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    /// The end-of-channel message.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            message_type: MessageType::None,
            payload: Bytes::new(),
        }
    }

    /// Message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Whether this marks the end of the channel.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.message_type == MessageType::None
    }

    /// Payload bytes.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Take the payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Reader over the payload fields.
    #[must_use]
    pub fn reader(&self) -> PayloadReader<'_> {
        PayloadReader::new(self.message_type, &self.payload)
    }
}

/// Encode a message header.
///
/// # Errors
/// Returns `MessageTooLarge` if `length` does not fit the `i32` length field.
pub fn encode_header(
    message_type: MessageType,
    length: usize,
) -> ProtocolResult<[u8; MESSAGE_HEADER_LEN]> {
    let length = i32::try_from(length).map_err(|_| ProtocolError::MessageTooLarge(length))?;
    let mut header = [0u8; MESSAGE_HEADER_LEN];
    header[0] = message_type.tag();
    header[1..].copy_from_slice(&length.to_le_bytes());
    Ok(header)
}

/// Decode a message header into its type and payload length.
///
/// # Errors
/// Returns `Malformed` for a negative length.
pub fn decode_header(header: [u8; MESSAGE_HEADER_LEN]) -> ProtocolResult<(MessageType, usize)> {
    let message_type = MessageType::from_tag(header[0]);
    let length = i32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let length = usize::try_from(length).map_err(|_| {
        ProtocolError::malformed(message_type, format!("negative length {length}"))
    })?;
    Ok((message_type, length))
}

/// Field encoders for message payloads.
pub trait PayloadWriter: BufMut {
    /// Write a `u32`-length-prefixed UTF-8 string.
    #[allow(clippy::cast_possible_truncation)]
    fn put_string(&mut self, value: &str) {
        self.put_u32_le(value.len() as u32);
        self.put_slice(value.as_bytes());
    }

    /// Write an optional string.
    fn put_option_string(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.put_u8(1);
                self.put_string(value);
            }
            None => self.put_u8(0),
        }
    }

    /// Write an optional `i32`.
    fn put_option_i32(&mut self, value: Option<i32>) {
        match value {
            Some(value) => {
                self.put_u8(1);
                self.put_i32_le(value);
            }
            None => self.put_u8(0),
        }
    }

    /// Write a list count.
    #[allow(clippy::cast_possible_truncation)]
    fn put_count(&mut self, count: usize) {
        self.put_u32_le(count as u32);
    }
}

impl<B: BufMut + ?Sized> PayloadWriter for B {}

/// Cursor over the fields of a message payload.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    message_type: MessageType,
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    /// Read fields of a `message_type` payload.
    #[must_use]
    pub const fn new(message_type: MessageType, data: &'a [u8]) -> Self {
        Self { message_type, data }
    }

    fn take(&mut self, len: usize, what: &str) -> ProtocolResult<&'a [u8]> {
        if self.data.len() < len {
            return Err(ProtocolError::malformed(
                self.message_type,
                format!("truncated {what}: need {len} bytes, have {}", self.data.len()),
            ));
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(head)
    }

    /// Read a `u8`.
    ///
    /// # Errors
    /// Returns `Malformed` if the payload is exhausted.
    pub fn read_u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Read a little-endian `i32`.
    ///
    /// # Errors
    /// Returns `Malformed` if the payload is exhausted.
    pub fn read_i32(&mut self) -> ProtocolResult<i32> {
        let bytes = self.take(4, "i32")?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a little-endian `u32`.
    ///
    /// # Errors
    /// Returns `Malformed` if the payload is exhausted.
    pub fn read_u32(&mut self) -> ProtocolResult<u32> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a length-prefixed string.
    ///
    /// # Errors
    /// Returns `Malformed` if the payload is exhausted or not UTF-8.
    pub fn read_string(&mut self) -> ProtocolResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len, "string")?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| ProtocolError::malformed(self.message_type, err.to_string()))
    }

    fn read_presence(&mut self) -> ProtocolResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            flag => Err(ProtocolError::malformed(
                self.message_type,
                format!("invalid presence flag {flag}"),
            )),
        }
    }

    /// Read an optional string.
    ///
    /// # Errors
    /// Returns `Malformed` on truncation or an invalid presence flag.
    pub fn read_option_string(&mut self) -> ProtocolResult<Option<String>> {
        if self.read_presence()? {
            self.read_string().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional `i32`.
    ///
    /// # Errors
    /// Returns `Malformed` on truncation or an invalid presence flag.
    pub fn read_option_i32(&mut self) -> ProtocolResult<Option<i32>> {
        if self.read_presence()? {
            self.read_i32().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read a list count, bounded by the bytes left so a corrupt count
    /// cannot trigger a huge allocation.
    ///
    /// # Errors
    /// Returns `Malformed` on truncation or an impossible count.
    pub fn read_count(&mut self) -> ProtocolResult<usize> {
        let count = self.read_u32()? as usize;
        if count > self.data.len() {
            return Err(ProtocolError::malformed(
                self.message_type,
                format!("list of {count} items in {} bytes", self.data.len()),
            ));
        }
        Ok(count)
    }

    /// Everything not read yet.
    #[must_use]
    pub fn remaining(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
}
