//! Message framing across a real socket pair.

use compute_buffer::BufferOptions;
use compute_protocol::{
    MessageChannel, MessageType, ProtocolError,
    catalog::{ExecuteOutput, XorRequest},
};
use compute_transport::ComputeSocket;

fn pair(chunk_length: usize) -> (MessageChannel, MessageChannel, ComputeSocket, ComputeSocket) {
    let (a, b) = tokio::io::duplex(4096);
    let left = ComputeSocket::new(a);
    let right = ComputeSocket::new(b);
    let options = BufferOptions::default().chunk_length(chunk_length);
    let near = MessageChannel::new(left.create_channel(1, options).unwrap());
    let far = MessageChannel::new(right.create_channel(1, options).unwrap());
    (near, far, left, right)
}

#[tokio::test]
async fn test_payload_sizes_survive_the_socket() {
    let (near, far, _left, _right) = pair(256);
    let large: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    let payloads = vec![Vec::new(), vec![7], large];

    // The large payload does not fit in the pipeline, so it can only be
    // sent while the far side is draining.
    let count = payloads.len();
    let receiver = tokio::spawn(async move {
        let mut received = Vec::new();
        for _ in 0..count {
            received.push(far.receive_as::<ExecuteOutput>().await.unwrap().data);
        }
        received
    });
    for payload in &payloads {
        near.send_raw(MessageType::ExecuteOutput, payload)
            .await
            .unwrap();
    }

    let received = receiver.await.unwrap();
    assert_eq!(received.len(), payloads.len());
    for (data, payload) in received.iter().zip(&payloads) {
        assert_eq!(data.as_ref(), payload.as_slice());
    }
}

#[tokio::test]
async fn test_messages_keep_order_both_ways() {
    let (near, far, _left, _right) = pair(64);

    for value in 0..20u8 {
        near.send(&XorRequest {
            value,
            data: vec![value; usize::from(value)].into(),
        })
        .await
        .unwrap();
    }
    far.send_raw(MessageType::WriteFilesResponse, b"").await.unwrap();

    for value in 0..20u8 {
        let request = far.receive_as::<XorRequest>().await.unwrap();
        assert_eq!(request.value, value);
        assert_eq!(request.data.len(), usize::from(value));
    }
    assert_eq!(
        near.receive().await.unwrap().message_type(),
        MessageType::WriteFilesResponse
    );
}

#[tokio::test]
async fn test_close_ends_the_peer() {
    let (near, far, _left, _right) = pair(64);
    near.send_raw(MessageType::Attach, b"").await.unwrap();
    near.close().await;

    assert_eq!(far.receive().await.unwrap().message_type(), MessageType::Attach);
    assert!(far.receive().await.unwrap().is_none());
    assert!(matches!(
        far.receive_as::<XorRequest>().await,
        Err(ProtocolError::ChannelClosed)
    ));
}
