//! Typed message framing over one compute channel.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use compute_buffer::{RingBufferReader, RingBufferWriter};
use compute_transport::ComputeChannel;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    catalog::MessageBody,
    error::{ProtocolError, ProtocolResult},
    message::{MESSAGE_HEADER_LEN, Message, MessageType, decode_header, encode_header},
};

/// Sends and receives framed messages on a channel.
///
/// At most one [`MessageBuilder`] may be open at a time, so a channel's own
/// frames never interleave. Receiving is serialized separately.
pub struct MessageChannel {
    id: i32,
    inbound: Mutex<Inbound>,
    writer: Arc<Mutex<RingBufferWriter>>,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl MessageChannel {
    /// Wrap a socket channel.
    #[must_use]
    pub fn new(channel: ComputeChannel) -> Self {
        let id = channel.id();
        let (reader, writer) = channel.into_parts();
        Self::from_parts(id, reader, writer)
    }

    /// Wrap a raw buffer pair.
    #[must_use]
    pub fn from_parts(id: i32, reader: RingBufferReader, writer: RingBufferWriter) -> Self {
        Self {
            id,
            inbound: Mutex::new(Inbound::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Channel id.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Start building a message of `message_type`, reserving `max_size`
    /// payload bytes.
    ///
    /// # Errors
    /// Returns `BuilderInUse` if another builder is open on this channel.
    pub fn create_message(
        &self,
        message_type: MessageType,
        max_size: usize,
    ) -> ProtocolResult<MessageBuilder> {
        let writer = Arc::clone(&self.writer)
            .try_lock_owned()
            .map_err(|_| ProtocolError::BuilderInUse)?;
        let mut body = BytesMut::with_capacity(MESSAGE_HEADER_LEN + max_size);
        body.put_bytes(0, MESSAGE_HEADER_LEN);
        Ok(MessageBuilder {
            writer,
            message_type,
            body,
        })
    }

    /// Encode and send a catalog message.
    ///
    /// # Errors
    /// Returns `BuilderInUse`, `MessageTooLarge` or a buffer error.
    pub async fn send<M: MessageBody>(&self, message: &M) -> ProtocolResult<()> {
        let mut builder = self.create_message(M::TYPE, message.size_hint())?;
        message.encode(builder.payload_mut());
        builder.send().await
    }

    /// Send a message with a raw payload.
    ///
    /// # Errors
    /// Returns `BuilderInUse`, `MessageTooLarge` or a buffer error.
    pub async fn send_raw(&self, message_type: MessageType, payload: &[u8]) -> ProtocolResult<()> {
        let mut builder = self.create_message(message_type, payload.len())?;
        builder.payload_mut().put_slice(payload);
        builder.send().await
    }

    /// Receive the next message.
    ///
    /// Returns a `None` message once the peer has finished and every
    /// message has been read. Cancel-safe: a frame that was partly read
    /// when the future was dropped is finished by the next call.
    ///
    /// # Errors
    /// Returns `Malformed` if the stream ends inside a message.
    pub async fn receive(&self) -> ProtocolResult<Message> {
        let mut inbound = self.inbound.lock().await;
        let Some(message) = inbound.next_message().await? else {
            return Ok(Message::none());
        };
        tracing::trace!(
            channel_id = self.id,
            message_type = ?message.message_type(),
            length = message.payload().len(),
            "Received message"
        );
        Ok(message)
    }

    /// Receive the next message as `M`.
    ///
    /// # Errors
    /// Returns `Remote` for an exception, `ChannelClosed` at end of channel,
    /// or `UnexpectedMessage` for any other kind.
    pub async fn receive_as<M: MessageBody>(&self) -> ProtocolResult<M> {
        let message = self.receive().await?;
        if message.is_none() {
            return Err(ProtocolError::ChannelClosed);
        }
        M::parse(&message)
    }

    /// Finish sending. The peer receives a `None` message after draining.
    ///
    /// Returns `false` if the channel was already closed.
    pub async fn close(&self) -> bool {
        self.writer.lock().await.mark_complete()
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.mark_complete();
        }
    }
}

/// Receive side of a channel.
///
/// Bytes leave the ring buffer as soon as they are copied, so the frame in
/// progress lives here between calls.
struct Inbound {
    reader: RingBufferReader,
    header: [u8; MESSAGE_HEADER_LEN],
    header_filled: usize,
    payload: Option<PartialPayload>,
}

struct PartialPayload {
    message_type: MessageType,
    data: Vec<u8>,
    filled: usize,
}

impl Inbound {
    const fn new(reader: RingBufferReader) -> Self {
        Self {
            reader,
            header: [0; MESSAGE_HEADER_LEN],
            header_filled: 0,
            payload: None,
        }
    }

    /// Read the rest of the current frame. `None` at a clean end of stream.
    ///
    /// Every await is a single `read_some`, which either copies and
    /// consumes bytes or does nothing.
    async fn next_message(&mut self) -> ProtocolResult<Option<Message>> {
        if self.payload.is_none() {
            while self.header_filled < MESSAGE_HEADER_LEN {
                let size = self
                    .reader
                    .read_some(&mut self.header[self.header_filled..])
                    .await;
                if size == 0 {
                    if self.header_filled == 0 {
                        return Ok(None);
                    }
                    return Err(ProtocolError::malformed(
                        MessageType::from_tag(self.header[0]),
                        "stream ended inside a message header",
                    ));
                }
                self.header_filled += size;
            }
            self.header_filled = 0;
            let (message_type, length) = decode_header(self.header)?;
            self.payload = Some(PartialPayload {
                message_type,
                data: vec![0; length],
                filled: 0,
            });
        }

        if let Some(partial) = self.payload.as_mut() {
            while partial.filled < partial.data.len() {
                let size = self
                    .reader
                    .read_some(&mut partial.data[partial.filled..])
                    .await;
                if size == 0 {
                    return Err(ProtocolError::malformed(
                        partial.message_type,
                        format!("stream ended inside a {} byte payload", partial.data.len()),
                    ));
                }
                partial.filled += size;
            }
        }
        Ok(self
            .payload
            .take()
            .map(|partial| Message::new(partial.message_type, partial.data)))
    }
}

/// Exclusive builder for one outgoing message.
///
/// Dropping the builder without sending discards the message.
pub struct MessageBuilder {
    writer: OwnedMutexGuard<RingBufferWriter>,
    message_type: MessageType,
    body: BytesMut,
}

impl std::fmt::Debug for MessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder")
            .field("message_type", &self.message_type)
            .field("length", &self.len())
            .finish_non_exhaustive()
    }
}

impl MessageBuilder {
    /// Message type being built.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Payload bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len() - MESSAGE_HEADER_LEN
    }

    /// Whether no payload has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Growable payload.
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// Patch the header and write the message into the channel.
    ///
    /// # Errors
    /// Returns `MessageTooLarge` or a buffer error.
    pub async fn send(mut self) -> ProtocolResult<()> {
        let length = self.len();
        let header = encode_header(self.message_type, length)?;
        self.body[..MESSAGE_HEADER_LEN].copy_from_slice(&header);
        self.writer.write(&self.body).await?;
        tracing::trace!(message_type = ?self.message_type, length, "Sent message");
        Ok(())
    }
}
