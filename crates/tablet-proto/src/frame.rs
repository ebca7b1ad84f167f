//! Message framing for wire transmission.
//!
//! ```text
//! +----------+-------------+----------+------------------+
//! | Magic(4) | CallId(8)   | Len(4)   | Payload(Len)     |
//! +----------+-------------+----------+------------------+
//! ```
//!
//! The payload is a bincode-encoded request envelope or response. Every
//! frame names the call it belongs to, so many calls can share one
//! connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tablet_common::constants::MAX_FRAME_SIZE;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic number for message framing.
pub const FRAME_MAGIC: u32 = 0x5442_4C54; // "TBLT"

/// Header size in bytes.
pub const HEADER_SIZE: usize = 4 + 8 + 4; // magic + call id + len

/// Errors produced while framing messages.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Message serialization failed.
    #[error("serialization failed: {0}")]
    Encode(String),

    /// Message deserialization failed.
    #[error("deserialization failed: {0}")]
    Decode(String),

    /// The frame header does not start with the magic number.
    #[error("invalid magic: {0:08x}")]
    BadMagic(u32),

    /// The payload exceeds the frame size limit.
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for framing operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Encodes a message into a frame.
///
/// # Errors
///
/// Fails if the message cannot be serialized or is too large.
pub fn encode<T: Serialize>(call_id: u64, message: &T) -> FrameResult<Bytes> {
    let payload = bincode::serialize(message).map_err(|e| FrameError::Encode(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(FRAME_MAGIC);
    buf.put_u64(call_id);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes a frame into `(call_id, message)`.
///
/// # Errors
///
/// Fails on a short or malformed frame.
pub fn decode<T: DeserializeOwned>(mut data: Bytes) -> FrameResult<(u64, T)> {
    if data.len() < HEADER_SIZE {
        return Err(FrameError::Decode("frame too short".to_string()));
    }

    let magic = data.get_u32();
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }

    let call_id = data.get_u64();
    let len = data.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    if data.len() < len {
        return Err(FrameError::Decode("incomplete frame".to_string()));
    }

    let payload = data.slice(..len);
    let message = bincode::deserialize(&payload).map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok((call_id, message))
}

/// Checks if a buffer starts with a complete frame.
///
/// Returns the frame size if complete, or `None` if more data is needed.
///
/// # Errors
///
/// Fails early on a bad magic number or an oversized length, so a reader
/// never waits for a frame that can not be accepted.
pub fn frame_size(data: &[u8]) -> FrameResult<Option<usize>> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let len = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let total = HEADER_SIZE + len;
    Ok((data.len() >= total).then_some(total))
}

/// Reads frames off a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads the next frame. Returns `None` when the peer closes the
    /// connection cleanly between frames.
    ///
    /// # Errors
    ///
    /// Fails on IO errors, malformed frames, or a connection closed in the
    /// middle of a frame.
    pub async fn next<T: DeserializeOwned>(&mut self) -> FrameResult<Option<(u64, T)>> {
        loop {
            if let Some(size) = frame_size(&self.buf)? {
                let data = self.buf.split_to(size).freeze();
                return decode(data).map(Some);
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }
}

/// Encodes and writes one frame.
///
/// # Errors
///
/// Fails if the message cannot be encoded or written.
pub async fn write_frame<W, T>(writer: &mut W, call_id: u64, message: &T) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = encode(call_id, message)?;
    writer.write_all(&data).await?;
    Ok(())
}
