use std::io;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{config::MAX_MESSAGE_SIZE, protocol::Message};

/// Failures while framing or decoding messages.
///
/// Every variant is fatal to the connection: a length-prefixed stream has no
/// point at which a reader could resynchronise.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("received a zero-length frame")]
    EmptyFrame,

    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_MESSAGE_SIZE)]
    FrameTooLarge(usize),

    #[error("stream ended inside a {expected} byte frame")]
    Truncated { expected: usize },

    #[error("malformed message: {0}")]
    Codec(#[from] bincode::Error),
}

/// Length-prefixed message framing over any bidirectional byte stream
pub struct MessageStream<S> {
    stream: S,
}

impl<S> MessageStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S: AsyncWrite + Unpin> MessageStream<S> {
    /// Send a message: 4-byte big-endian length, then the encoded envelope
    pub async fn send_message(&mut self, msg: &Message) -> Result<(), TransportError> {
        let body = bincode::serialize(msg)?;
        if body.is_empty() {
            return Err(TransportError::EmptyFrame);
        }
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::FrameTooLarge(body.len()));
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> MessageStream<S> {
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream before a complete
    /// length prefix arrived.
    pub async fn recv_message(&mut self) -> Result<Option<Message>, TransportError> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(TransportError::EmptyFrame);
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        match self.stream.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Truncated { expected: len });
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Some(bincode::deserialize(&body)?))
    }
}

/// Encode a type-specific payload for placement inside an envelope
pub fn serialize_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(bincode::serialize(value)?)
}

/// Decode a type-specific payload taken from an envelope
pub fn deserialize_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;
    use crate::protocol::{AuthRequest, MessageType};

    fn sample_message() -> Message {
        let payload = serialize_payload(&AuthRequest {
            client_pid:      4242,
            timestamp:       1_700_000_000,
            signature:       "c2lnbmF0dXJl".to_string(),
            executable_path: "/usr/bin/netpulse-ui".to_string(),
        })
        .unwrap();
        Message::new(MessageType::Authenticate, "req-1", payload)
    }

    #[tokio::test]
    async fn test_send_then_receive_reconstructs_envelope() {
        let (client, server) = duplex(4096);
        let mut tx = MessageStream::new(client);
        let mut rx = MessageStream::new(server);

        let msg = sample_message();
        tx.send_message(&msg).await.unwrap();

        let received = rx.recv_message().await.unwrap().expect("message");
        assert_eq!(received, msg);

        let auth: AuthRequest = deserialize_payload(&received.payload).unwrap();
        assert_eq!(auth.client_pid, 4242);
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let (client, mut server) = duplex(4096);
        let mut tx = MessageStream::new(client);
        let msg = Message::empty(MessageType::Heartbeat, "hb");
        tx.send_message(&msg).await.unwrap();

        let mut prefix = [0u8; 4];
        server.read_exact(&mut prefix).await.unwrap();
        let expected = bincode::serialize(&msg).unwrap().len() as u32;
        assert_eq!(prefix, expected.to_be_bytes());
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (client, server) = duplex(64);
        drop(client);
        let mut rx = MessageStream::new(server);
        assert!(rx.recv_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_length_prefix_returns_none() {
        let (mut client, server) = duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        let mut rx = MessageStream::new(server);
        assert!(rx.recv_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_rejected() {
        let (mut client, server) = duplex(64);
        client.write_all(&0u32.to_be_bytes()).await.unwrap();
        let mut rx = MessageStream::new(server);
        assert!(matches!(
            rx.recv_message().await,
            Err(TransportError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_before_reading_body() {
        let (mut client, server) = duplex(64);
        let len = (MAX_MESSAGE_SIZE + 1) as u32;
        client.write_all(&len.to_be_bytes()).await.unwrap();
        let mut rx = MessageStream::new(server);
        match rx.recv_message().await {
            Err(TransportError::FrameTooLarge(n)) => assert_eq!(n, MAX_MESSAGE_SIZE + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_message_names_the_limit() {
        let err = TransportError::FrameTooLarge(MAX_MESSAGE_SIZE + 1);
        assert_eq!(
            err.to_string(),
            format!(
                "frame of {} bytes exceeds the {} byte limit",
                MAX_MESSAGE_SIZE + 1,
                MAX_MESSAGE_SIZE
            )
        );
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let (mut client, server) = duplex(64);
        client.write_all(&16u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);
        let mut rx = MessageStream::new(server);
        assert!(matches!(
            rx.recv_message().await,
            Err(TransportError::Truncated { expected: 16 })
        ));
    }

    #[tokio::test]
    async fn test_garbage_body_is_a_codec_error() {
        let (mut client, server) = duplex(64);
        client.write_all(&4u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        let mut rx = MessageStream::new(server);
        assert!(matches!(
            rx.recv_message().await,
            Err(TransportError::Codec(_))
        ));
    }

    #[test]
    fn test_payload_decode_rejects_wrong_shape() {
        let bytes = serialize_payload(&7u8).unwrap();
        assert!(deserialize_payload::<AuthRequest>(&bytes).is_err());
    }
}
