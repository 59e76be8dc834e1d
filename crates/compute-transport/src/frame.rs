//! Socket frame header codec.
//!
//! Every frame starts with `i32 channel_id, i32 size`, both little-endian.
//! A non-negative size is followed by that many payload bytes; [`DETACH`]
//! carries no payload and ends the channel's inbound stream.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{SocketError, SocketResult};

/// Encoded header length in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Size sentinel announcing that no more data will arrive on a channel.
pub const DETACH: i32 = -2;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// `size` payload bytes follow.
    Data { channel_id: i32, size: usize },
    /// End of the channel's stream.
    Detach { channel_id: i32 },
}

impl FrameHeader {
    /// Channel the frame is addressed to.
    #[must_use]
    pub const fn channel_id(&self) -> i32 {
        match self {
            Self::Data { channel_id, .. } | Self::Detach { channel_id } => *channel_id,
        }
    }

    /// Encode the header.
    ///
    /// # Panics
    /// Panics if a data frame is larger than `i32::MAX` bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let (channel_id, size) = match *self {
            Self::Data { channel_id, size } => (
                channel_id,
                i32::try_from(size).expect("frame payload exceeds i32::MAX"),
            ),
            Self::Detach { channel_id } => (channel_id, DETACH),
        };
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&channel_id.to_le_bytes());
        header[4..].copy_from_slice(&size.to_le_bytes());
        header
    }

    /// Decode a header.
    ///
    /// # Errors
    /// Returns `MalformedFrame` for negative sizes other than [`DETACH`].
    pub fn decode(header: [u8; FRAME_HEADER_LEN]) -> SocketResult<Self> {
        let channel_id = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        match size {
            DETACH => Ok(Self::Detach { channel_id }),
            size => usize::try_from(size)
                .map(|size| Self::Data { channel_id, size })
                .map_err(|_| SocketError::MalformedFrame { channel_id, size }),
        }
    }
}

/// Read the next header, or `None` on a clean end of stream.
///
/// # Errors
/// Returns `Io` if the stream ends inside a header, or `MalformedFrame`.
pub async fn read_header<R>(reader: &mut R) -> SocketResult<Option<FrameHeader>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }
    FrameHeader::decode(header).map(Some)
}
