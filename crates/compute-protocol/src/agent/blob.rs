//! `ReadBlob`: stream a blob range in bounded chunks.

use compute_core::BlobStorage;

use super::ComputeHandler;
use crate::{
    catalog::{ReadBlob, ReadBlobResponse},
    channel::MessageChannel,
    error::{ProtocolError, ProtocolResult},
};

/// Largest `ReadBlobResponse` payload.
pub const MAX_BLOB_CHUNK: usize = 512 * 1024;

impl ComputeHandler {
    pub(super) async fn read_blob(
        &self,
        channel: &MessageChannel,
        request: ReadBlob,
    ) -> ProtocolResult<()> {
        let data = read_range(self.storage.as_ref(), &request).await?;
        let total_length = i32::try_from(data.len())
            .map_err(|_| ProtocolError::InvalidRequest(format!("{} bytes to return", data.len())))?;
        tracing::debug!(
            channel_id = channel.id(),
            locator = %request.locator,
            offset = request.offset,
            total_length,
            "Reading blob"
        );

        // An empty range still gets one response so the reader can finish.
        let mut offset = 0;
        loop {
            let end = data.len().min(offset + MAX_BLOB_CHUNK);
            channel
                .send(&ReadBlobResponse {
                    chunk_offset: i32::try_from(offset).unwrap_or(total_length),
                    total_length,
                    data: data.slice(offset..end),
                })
                .await?;
            offset = end;
            if offset >= data.len() {
                return Ok(());
            }
        }
    }
}

async fn read_range(
    storage: &dyn BlobStorage,
    request: &ReadBlob,
) -> ProtocolResult<bytes::Bytes> {
    if request.is_whole() {
        return Ok(storage.read_blob(&request.locator, 0, None).await?);
    }
    let offset = u64::try_from(request.offset)
        .map_err(|_| ProtocolError::InvalidRequest(format!("negative offset {}", request.offset)))?;
    let length = u64::try_from(request.length)
        .map_err(|_| ProtocolError::InvalidRequest(format!("negative length {}", request.length)))?;
    Ok(storage
        .read_blob(&request.locator, offset, Some(length))
        .await?)
}
