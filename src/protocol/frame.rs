//! Frame codec
//!
//! A frame is laid out with its metadata at the tail:
//!
//! ```text
//! ┌───────────────┬──────────────┬──────────────┐
//! │ body          │ extend       │ length       │
//! │ N bytes       │ u64 BE       │ u64 BE       │
//! └───────────────┴──────────────┴──────────────┘
//! ```
//!
//! `length` is the size of the whole frame (`N + 16`). Message sockets carry
//! exactly one frame per message. Stream sockets prefix every frame with an
//! 8-byte big-endian copy of `length` (the envelope) so that the boundary
//! detector can find the end of a frame from its first bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Size of the `extend` field
pub const EXTEND_SIZE: usize = 8;

/// Size of the trailing `length` field
pub const LENGTH_SIZE: usize = 8;

/// Fixed per-frame overhead (extend + length)
pub const FRAME_OVERHEAD: usize = EXTEND_SIZE + LENGTH_SIZE;

/// Size of the leading length copy used on stream sockets
pub const ENVELOPE_SIZE: usize = 8;

/// A decoded application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opaque payload
    pub body: Bytes,
    /// Application-defined metadata carried alongside the payload
    pub extend: u64,
    /// Total encoded size of the frame in bytes
    pub length: u64,
}

impl Frame {
    /// Create a frame, computing its encoded length
    pub fn new(body: impl Into<Bytes>, extend: u64) -> Self {
        let body = body.into();
        let length = (body.len() + FRAME_OVERHEAD) as u64;
        Self {
            body,
            extend,
            length,
        }
    }

    /// Encode into the canonical frame layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.body.len() + FRAME_OVERHEAD);
        buf.put_slice(&self.body);
        buf.put_u64(self.extend);
        buf.put_u64(self.length);
        buf.freeze()
    }

    /// Decode one complete frame
    ///
    /// The buffer must hold exactly one frame: its trailing length has to
    /// match the buffer size.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let length = validate(buf)?;
        let body_end = buf.len() - FRAME_OVERHEAD;
        Ok(Self {
            body: Bytes::copy_from_slice(&buf[..body_end]),
            extend: read_u64(&buf[body_end..body_end + EXTEND_SIZE]),
            length,
        })
    }

    /// Decode from shared bytes without copying the body
    pub fn decode_bytes(mut buf: Bytes) -> Result<Self, FrameError> {
        let length = validate(&buf)?;
        let body_end = buf.len() - FRAME_OVERHEAD;
        let extend = read_u64(&buf[body_end..body_end + EXTEND_SIZE]);
        buf.truncate(body_end);
        Ok(Self {
            body: buf,
            extend,
            length,
        })
    }
}

/// Check that `buf` holds exactly one well-formed frame, returning its length
pub fn validate(buf: &[u8]) -> Result<u64, FrameError> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort {
            len: buf.len(),
            min: FRAME_OVERHEAD,
        });
    }
    let length = read_u64(&buf[buf.len() - LENGTH_SIZE..]);
    if length == 0 {
        return Err(FrameError::ZeroLength);
    }
    if length != buf.len() as u64 {
        return Err(FrameError::LengthMismatch {
            declared: length,
            actual: buf.len() as u64,
        });
    }
    Ok(length)
}

/// Read the leading length of a stream envelope, if enough bytes are buffered
pub fn peek_length(buffered: &[u8]) -> Option<u64> {
    if buffered.len() < ENVELOPE_SIZE {
        return None;
    }
    Some(read_u64(&buffered[..ENVELOPE_SIZE]))
}

/// Prefix an encoded frame with its stream envelope
pub fn envelope(frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + frame.len());
    buf.put_u64(frame.len() as u64);
    buf.put_slice(frame);
    buf.freeze()
}

/// Incremental boundary detector for stream sockets
///
/// Returns how many bytes to consume and, once a whole frame is buffered,
/// the frame bytes (without envelope). `(0, None)` means more data is needed,
/// or a clean end of stream when `at_eof` is set and nothing is buffered.
pub fn scan_boundary(buffered: &[u8], at_eof: bool) -> Result<(usize, Option<&[u8]>), FrameError> {
    if at_eof && buffered.is_empty() {
        return Ok((0, None));
    }

    let length = match peek_length(buffered) {
        Some(length) => length,
        None if at_eof => {
            return Err(FrameError::Truncated {
                buffered: buffered.len(),
            })
        }
        None => return Ok((0, None)),
    };

    if length == 0 {
        return Err(FrameError::ZeroLength);
    }
    if length < FRAME_OVERHEAD as u64 {
        return Err(FrameError::TooShort {
            len: length as usize,
            min: FRAME_OVERHEAD,
        });
    }

    let available = (buffered.len() - ENVELOPE_SIZE) as u64;
    if available < length {
        if at_eof {
            return Err(FrameError::Truncated {
                buffered: buffered.len(),
            });
        }
        return Ok((0, None));
    }

    let end = ENVELOPE_SIZE + length as usize;
    let frame = &buffered[ENVELOPE_SIZE..end];
    let trailer = read_u64(&frame[frame.len() - LENGTH_SIZE..]);
    if trailer != length {
        return Err(FrameError::LengthMismatch {
            declared: length,
            actual: trailer,
        });
    }

    Ok((end, Some(frame)))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}
