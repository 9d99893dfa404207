//! # Transport
//!
//! [`MessageTransport`] is the byte-stream collaborator a session runs over.
//! [`StreamTransport`] implements it for any tokio `AsyncRead`/`AsyncWrite`
//! pair using length-prefixed frames:
//!
//! ```text
//! +----------------+-----------+---------------------+
//! | length: u32 LE | kind: u8  | payload (codec)     |
//! +----------------+-----------+---------------------+
//!                  |<------- length bytes ---------->|
//! ```
//!
//! The kind byte is the [`MessageKind`] tag and must agree with the decoded
//! payload. Before the first frame the handshake exchanges raw bytes through
//! [`MessageTransport::write_raw`] and [`MessageTransport::read_raw`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

use super::codec::{CodecError, JsonCodec, MessageCodec};
use super::message::{Message, MessageKind};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Frame of {length} bytes exceeds the limit of {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Stream ended after {0} bytes of a frame header")]
    TruncatedHeader(usize),
    #[error("Unknown message kind tag: {0}")]
    UnknownKind(u8),
    #[error("Frame tagged {tag} carries a {found} message")]
    TagMismatch {
        tag: MessageKind,
        found: MessageKind,
    },
    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: &Message) -> TransportResult<()>;

    /// Next message, or `None` once the peer closed the stream cleanly.
    async fn receive(&self) -> TransportResult<Option<Message>>;

    async fn write_raw(&self, bytes: &[u8]) -> TransportResult<()>;

    async fn read_raw(&self, len: usize) -> TransportResult<Vec<u8>>;

    async fn close(&self) -> TransportResult<()>;
}

pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    codec: Arc<dyn MessageCodec>,
    max_frame_length: usize,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, codec: Arc<dyn MessageCodec>, max_frame_length: usize) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            codec,
            max_frame_length,
        }
    }

    pub fn json(reader: R, writer: W, max_frame_length: usize) -> Self {
        Self::new(reader, writer, Arc::new(JsonCodec), max_frame_length)
    }
}

pub type MemoryTransport = StreamTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Two connected in-process transports using the JSON codec.
pub fn memory_pair(max_frame_length: usize) -> (MemoryTransport, MemoryTransport) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        StreamTransport::json(a_read, a_write, max_frame_length),
        StreamTransport::json(b_read, b_write, max_frame_length),
    )
}

#[async_trait]
impl<R, W> MessageTransport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    #[instrument(level = "trace", skip(self, message), fields(kind = %message.kind()))]
    async fn send(&self, message: &Message) -> TransportResult<()> {
        let payload = self.codec.encode(message)?;
        let length = payload.len() + 1;
        if length > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }
        let mut frame = Vec::with_capacity(length + 4);
        frame.extend_from_slice(&(length as u32).to_le_bytes());
        frame.push(message.kind() as u8);
        frame.extend_from_slice(&payload);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!("Sent frame of {} bytes", length);
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<Message>> {
        let mut reader = self.reader.lock().await;
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match reader.read(&mut header[filled..]).await? {
                0 if filled == 0 => {
                    debug!("Transport reached end of stream");
                    return Ok(None);
                }
                0 => return Err(TransportError::TruncatedHeader(filled)),
                n => filled += n,
            }
        }
        let length = u32::from_le_bytes(header) as usize;
        if length == 0 {
            return Err(TransportError::EmptyFrame);
        }
        if length > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }
        let mut frame = vec![0u8; length];
        reader.read_exact(&mut frame).await?;
        drop(reader);

        let tag = MessageKind::from_repr(frame[0]).ok_or(TransportError::UnknownKind(frame[0]))?;
        let message = self.codec.decode(&frame[1..])?;
        if message.kind() != tag {
            return Err(TransportError::TagMismatch {
                tag,
                found: message.kind(),
            });
        }
        trace!("Received {} frame of {} bytes", tag, length);
        Ok(Some(message))
    }

    async fn write_raw(&self, bytes: &[u8]) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_raw(&self, len: usize) -> TransportResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut reader = self.reader.lock().await;
        match reader.read_exact(&mut buf).await {
            Ok(_) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_frames_round_trip_in_order() {
        let (a, b) = memory_pair(1024);
        a.send(&Message::Argument(Value::Int(1))).await.unwrap();
        a.send(&Message::OnNext(Value::from("x"))).await.unwrap();
        a.send(&Message::OnCompleted).await.unwrap();
        a.close().await.unwrap();

        assert_eq!(
            b.receive().await.unwrap(),
            Some(Message::Argument(Value::Int(1)))
        );
        assert_eq!(
            b.receive().await.unwrap(),
            Some(Message::OnNext(Value::from("x")))
        );
        assert_eq!(b.receive().await.unwrap(), Some(Message::OnCompleted));
        assert_eq!(b.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (a, _b) = memory_pair(8);
        let result = a.send(&Message::OnNext(Value::from("far too long"))).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_tag_mismatch_is_rejected() {
        let (a, b) = memory_pair(1024);
        let payload = serde_json::to_vec(&Message::OnCompleted).unwrap();
        let mut frame = ((payload.len() + 1) as u32).to_le_bytes().to_vec();
        frame.push(MessageKind::OnNext as u8);
        frame.extend_from_slice(&payload);
        a.write_raw(&frame).await.unwrap();

        assert!(matches!(
            b.receive().await,
            Err(TransportError::TagMismatch {
                tag: MessageKind::OnNext,
                found: MessageKind::OnCompleted
            })
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_header_is_an_error() {
        let (a, b) = memory_pair(1024);
        a.write_raw(&[7, 0]).await.unwrap();
        a.close().await.unwrap();
        assert!(matches!(
            b.receive().await,
            Err(TransportError::TruncatedHeader(2))
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_body_is_an_error() {
        let (a, b) = memory_pair(1024);
        a.write_raw(&[9, 0, 0, 0, MessageKind::OnCompleted as u8]).await.unwrap();
        a.close().await.unwrap();
        assert!(matches!(b.receive().await, Err(TransportError::Io(_))));
    }
}
