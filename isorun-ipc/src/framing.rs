//! Length-Prefixed Frame Encoding
//!
//! Provides message boundaries over the worker pipe. The worker writes whole
//! frames; the supervisor reads whatever bytes the pipe currently holds and
//! decodes frames out of a [`FrameBuffer`] once they are complete, so it never
//! blocks on a half-written frame.

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Maximum frame size (16 MB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the little-endian length prefix
const LEN_PREFIX: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Write a message with length prefix to a writer
///
/// Frame format:
/// ```text
/// +----------------+------------------+
/// | length (4 LE)  | rkyv payload     |
/// +----------------+------------------+
/// ```
pub fn write_frame<W, T>(writer: &mut BufWriter<W>, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize<AllocSerializer<256>>,
{
    let bytes =
        rkyv::to_bytes::<_, 256>(message).map_err(|e| FrameError::Serialization(e.to_string()))?;

    let len = bytes.len();
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(len as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;

    // The worker exits right after reporting; nothing may stay buffered.
    writer.flush()?;

    Ok(())
}

/// Validate and deserialize one rkyv payload.
fn decode_payload<T>(payload: &[u8]) -> Result<T, FrameError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    // rkyv needs an aligned buffer; pipe reads give no alignment guarantee
    let mut buf = rkyv::AlignedVec::with_capacity(payload.len());
    buf.extend_from_slice(payload);

    let archived = rkyv::check_archived_root::<T>(&buf)
        .map_err(|e| FrameError::Deserialization(e.to_string()))?;

    let value: T = archived
        .deserialize(&mut Infallible)
        .expect("infallible deserialization");

    Ok(value)
}

/// Frame writer wrapper for convenient message sending
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Create a new frame writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(64 * 1024, writer), // 64KB buffer
        }
    }

    /// Write a message
    pub fn write<T>(&mut self, message: &T) -> Result<(), FrameError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        write_frame(&mut self.writer, message)
    }
}

/// Accumulates raw bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a decoded frame
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Decode the next frame if it has fully arrived.
    ///
    /// Returns `Ok(None)` while the length prefix or the payload is still
    /// incomplete. A decoded frame is removed from the buffer.
    pub fn try_decode<T>(&mut self) -> Result<Option<T>, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut len_buf = [0u8; LEN_PREFIX];
        len_buf.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if len == 0 {
            return Err(FrameError::InvalidFrame("zero-length frame".to_string()));
        }

        let end = LEN_PREFIX + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let value = decode_payload(&self.buf[LEN_PREFIX..end])?;
        self.buf.drain(..end);
        Ok(Some(value))
    }
}
