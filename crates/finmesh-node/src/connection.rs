//! Per-connection plumbing: framed reads and the serialized writer task.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use finmesh_protocol::{Envelope, MAX_MESSAGE_SIZE, ProtocolError, encode_envelope};

use crate::error::{NodeError, NodeResult};

/// Splits a stream and spawns its writer task.
///
/// All outbound traffic for the connection goes through the returned sender,
/// so a reply generated inside a receive loop and a concurrent broadcast
/// never interleave bytes. The writer exits on the first write failure,
/// closing the channel; later sends then report the peer as gone.
pub(crate) fn open(stream: TcpStream, queue: usize) -> (mpsc::Sender<Envelope>, OwnedReadHalf) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(queue.max(1));
    tokio::spawn(write_loop(write_half, rx));
    (tx, read_half)
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_envelope(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, kind = %envelope.kind, "dropping unencodable envelope");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            warn!(error = %e, "connection write failed");
            break;
        }
    }
    debug!("connection writer stopped");
}

/// Reads the next framed envelope off a connection.
///
/// `Ok(None)` means the peer closed cleanly. A rejected body
/// ([`ProtocolError::Malformed`], [`ProtocolError::Invalid`],
/// [`ProtocolError::EmptyMessage`]) leaves the stream at the next frame
/// boundary, so the caller may log it and keep reading; transport errors and
/// oversize claims do not, and the connection must be abandoned.
pub(crate) async fn read_envelope(reader: &mut OwnedReadHalf) -> NodeResult<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(ProtocolError::EmptyMessage.into());
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        }
        .into());
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Envelope::from_json_slice(&payload)?))
}

/// True when a read error consumed a whole frame and the connection can keep
/// serving later messages.
pub(crate) fn frame_error_is_recoverable(err: &NodeError) -> bool {
    matches!(
        err,
        NodeError::Protocol(
            ProtocolError::Malformed(_) | ProtocolError::Invalid { .. } | ProtocolError::EmptyMessage
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use finmesh_protocol::MessageKind;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn writer_sends_framed_envelopes_in_order() {
        let (client, server) = stream_pair().await;
        let (tx, read_half) = open(client, 8);
        drop(read_half);

        for i in 0..3 {
            let envelope = Envelope::broadcast(MessageKind::Chat, json!({"seq": i}), "node_a");
            tx.send(envelope).await.unwrap();
        }

        let (mut server_read, _server_write) = server.into_split();
        for i in 0..3 {
            let envelope = read_envelope(&mut server_read).await.unwrap().unwrap();
            assert_eq!(envelope.content, json!({"seq": i}));
        }
    }

    #[tokio::test]
    async fn read_envelope_reports_clean_close() {
        let (client, server) = stream_pair().await;
        let (mut server_read, _server_write) = server.into_split();
        drop(client);

        let result = read_envelope(&mut server_read).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_envelope_rejects_garbage_body_recoverably() {
        let (mut client, server) = stream_pair().await;
        let (mut server_read, _server_write) = server.into_split();

        let body = b"definitely not json";
        client
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(body).await.unwrap();

        let err = read_envelope(&mut server_read).await.unwrap_err();
        assert!(frame_error_is_recoverable(&err));

        // The stream is still usable for the next, valid frame.
        let envelope = Envelope::broadcast(MessageKind::Heartbeat, json!({}), "node_a");
        let frame = encode_envelope(&envelope).unwrap();
        client.write_all(&frame).await.unwrap();

        let parsed = read_envelope(&mut server_read).await.unwrap().unwrap();
        assert_eq!(parsed.kind, MessageKind::Heartbeat);
    }

    #[test]
    fn oversize_claim_is_not_recoverable() {
        let err = NodeError::Protocol(ProtocolError::MessageTooLarge {
            size: MAX_MESSAGE_SIZE + 1,
            max: MAX_MESSAGE_SIZE,
        });
        assert!(!frame_error_is_recoverable(&err));
    }
}
