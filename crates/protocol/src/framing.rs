//! Length-prefixed framing for Noise messages on a byte stream.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "FSH1"
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload (one Noise handshake or transport message)
//!
//! Payloads are ciphertext, so no compression is attempted.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::noise::MAX_NOISE_MESSAGE_SIZE;

/// Magic bytes identifying a FileShell frame.
pub const FRAME_MAGIC: [u8; 4] = *b"FSH1";

/// Frame header size: 4 (magic) + 4 (length) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum frame size: one maximal Noise message plus the header.
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_NOISE_MESSAGE_SIZE;

/// Size of each read from the underlying stream.
const READ_CHUNK: usize = 8 * 1024;

/// A single frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The payload data.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let total_size = FRAME_HEADER_SIZE + frame.payload.len();
        if total_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut output = Vec::with_capacity(total_size);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        output.extend_from_slice(&frame.payload);
        Ok(output)
    }

    /// Try to decode a frame from the front of `data`.
    ///
    /// Returns `None` if more bytes are needed, otherwise the frame and the
    /// number of bytes consumed. Bad magic or an oversized length is reported
    /// as a deserialization error since it can only come from a corrupt or
    /// hostile stream.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = &data[0..4];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::Deserialization(format!(
                "invalid frame magic: expected {:02x?}, got {:02x?}",
                FRAME_MAGIC, magic
            )));
        }

        let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let total_size = FRAME_HEADER_SIZE + length;
        if total_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "frame length {} exceeds maximum of {}",
                total_size, MAX_FRAME_SIZE
            )));
        }

        if data.len() < total_size {
            return Ok(None);
        }

        let frame = Frame::new(data[FRAME_HEADER_SIZE..total_size].to_vec());
        Ok(Some((frame, total_size)))
    }

    /// Write one frame to the stream and flush it.
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame from the stream.
    ///
    /// `buffer` holds bytes read past the end of the previous frame and must
    /// be reused across calls on the same stream.
    pub async fn read_frame<R>(&self, reader: &mut R, buffer: &mut Vec<u8>) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((frame, consumed)) = self.try_decode(buffer)? {
                buffer.drain(..consumed);
                return Ok(frame);
            }

            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed(if buffer.is_empty() {
                    "peer closed the connection".to_string()
                } else {
                    "peer closed the connection mid-frame".to_string()
                }));
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }
}
