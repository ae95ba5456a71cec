//! Envelope transport over a byte stream.
//!
//! Frames are encoded with the protocol [`FrameCodec`]; each frame carries
//! one MessagePack [`Envelope`]. The reader and writer halves are independent
//! so a connection can read requests while another task writes pushes.

use bytes::{Buf, BytesMut};
use protocol::{Envelope, Frame, FrameCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Initial read buffer capacity.
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads envelopes from a stream.
pub struct EnvelopeReader<R> {
    reader: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            codec: FrameCodec::new(),
        }
    }

    /// Read the next envelope.
    ///
    /// Returns `None` if the peer closed the stream between frames.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, a malformed frame, an undecodable
    /// payload, or a stream that ends in the middle of a frame.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        loop {
            if let Some((frame, consumed)) = self.codec.try_decode(&self.buffer)? {
                self.buffer.advance(consumed);
                return Envelope::from_msgpack(&frame.payload).map(Some);
            }

            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::ConnectionClosed(format!(
                    "stream ended inside a frame ({} bytes buffered)",
                    self.buffer.len()
                )));
            }
        }
    }
}

/// Writes envelopes to a stream.
pub struct EnvelopeWriter<W> {
    writer: W,
    codec: FrameCodec,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            codec: FrameCodec::new(),
        }
    }

    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let payload = envelope.to_msgpack()?;
        let bytes = self.codec.encode(&Frame::new(payload))?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush and close the write side.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
