//! Stream read buffer
//!
//! Accumulates bytes from a stream socket and cuts them into frames with the
//! boundary detector. The buffer starts small and doubles on demand up to a
//! hard cap; a frame that cannot fit under the cap is a framing error.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{FrameError, Result};
use crate::protocol::frame::{peek_length, scan_boundary, ENVELOPE_SIZE};

/// Frame reader over a byte stream
#[derive(Debug)]
pub struct FrameReader {
    /// Buffered but unconsumed bytes
    buffer: BytesMut,
    /// Current buffer limit, doubled on demand
    limit: usize,
    /// Hard cap of the buffer
    max: usize,
}

impl FrameReader {
    /// Create a reader with the given initial and maximum buffer sizes
    pub fn new(initial: usize, max: usize) -> Self {
        let initial = initial.clamp(1, max.max(1));
        Self {
            buffer: BytesMut::with_capacity(initial),
            limit: initial,
            max,
        }
    }

    /// Number of buffered bytes not yet consumed
    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Current buffer limit
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append raw bytes, as if they had been read from the socket
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame from the buffer, if there is one
    ///
    /// The returned bytes are the canonical frame with the envelope removed.
    pub fn try_next(&mut self, at_eof: bool) -> std::result::Result<Option<Bytes>, FrameError> {
        if let Some(size) = self.declared_size() {
            if size > self.max as u64 {
                return Err(FrameError::TooLarge {
                    size,
                    max: self.max,
                });
            }
        }

        let consumed = match scan_boundary(&self.buffer, at_eof)? {
            (consumed, Some(_)) => consumed,
            (_, None) => return Ok(None),
        };

        let mut frame = self.buffer.split_to(consumed);
        frame.advance(ENVELOPE_SIZE);
        Ok(Some(frame.freeze()))
    }

    /// Read from `io` until a frame is complete
    ///
    /// Returns `Ok(None)` on a clean end of stream. Cancel safe: partially
    /// read data stays buffered.
    pub async fn next_frame<R>(&mut self, io: &mut R) -> Result<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_next(false)? {
                return Ok(Some(frame));
            }

            if self.buffer.len() >= self.limit {
                self.grow()?;
            }

            let room = self.limit - self.buffer.len();
            self.buffer.reserve(room);
            let n = (&mut *io).take(room as u64).read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Ok(self.try_next(true)?);
            }
        }
    }

    /// Wire size of the buffered frame, envelope included, once its envelope
    /// has arrived
    ///
    /// The length is peer-supplied; saturates instead of overflowing.
    fn declared_size(&self) -> Option<u64> {
        peek_length(&self.buffer).map(|length| length.saturating_add(ENVELOPE_SIZE as u64))
    }

    fn grow(&mut self) -> std::result::Result<(), FrameError> {
        if self.limit >= self.max {
            let size = self
                .declared_size()
                .unwrap_or(self.buffer.len() as u64);
            return Err(FrameError::TooLarge {
                size,
                max: self.max,
            });
        }
        self.limit = (self.limit * 2).min(self.max);
        Ok(())
    }
}
