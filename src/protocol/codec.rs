//! Framed envelope codec: a 4-byte big-endian length prefix followed by
//! the msgpack payload.

use crate::{errors::ProtocolError, protocol::Message};
use std::io::ErrorKind;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

/// Frames above this size are treated as malformed rather than buffered.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Reads framed envelopes from a byte stream. One decoder per connection,
/// driven only by the session's read loop.
pub struct FrameDecoder<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameDecoder<R> {
    pub fn new(reader: R) -> Self {
        FrameDecoder { reader }
    }

    /// Read one envelope. `EndOfStream` means the peer closed at a frame
    /// boundary; every other failure is malformed input and fatal for the
    /// connection.
    pub async fn decode(&mut self) -> Result<Message, ProtocolError> {
        let mut header = [0u8; 4];
        if let Err(err) = self.reader.read_exact(&mut header).await {
            return Err(match err.kind() {
                ErrorKind::UnexpectedEof => ProtocolError::EndOfStream,
                _ => ProtocolError::Io(err),
            });
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_BYTES));
        }
        // EOF mid-frame is a truncated frame, not a clean close
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(rmp_serde::from_slice(&payload)?)
    }
}

/// Writes framed envelopes to a byte stream. Whole frames are written
/// under an internal lock, so one encoder can be shared by every
/// downstream replying on the same connection without interleaving bytes.
pub struct FrameEncoder {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FrameEncoder {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        FrameEncoder {
            writer: Mutex::new(writer),
        }
    }

    /// Write one envelope atomically with respect to other `encode` calls.
    pub async fn encode(&self, message: &Message) -> Result<(), ProtocolError> {
        let payload = rmp_serde::to_vec(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }
}
