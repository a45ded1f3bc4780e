//! Length-prefixed frame reassembly for stream transports.
//!
//! On byte-stream transports every frame travels behind a 3-byte big-endian
//! length prefix:
//! ```text
//! ┌───────────┬──────────────────────────┐
//! │ Length    │ Frame                    │
//! │ 3 bytes   │ `length` bytes           │
//! │ uint24 BE │ header + body            │
//! └───────────┴──────────────────────────┘
//! ```
//!
//! [`FrameBuffer`] accumulates partial reads and yields complete frames
//! with the prefix stripped. A state machine handles fragmented reads:
//! - `WaitingForLength`: need the 3 prefix bytes
//! - `WaitingForFrame`: prefix parsed, need N more frame bytes

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RSocketError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 3;

/// Largest frame expressible in the 24-bit prefix.
pub const MAX_FRAME_LENGTH: usize = 0xFF_FFFF;

/// State machine for prefix parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for the complete 3-byte prefix.
    WaitingForLength,
    /// Prefix parsed, waiting for frame bytes.
    WaitingForFrame { remaining: usize },
}

/// Buffer accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single `BytesMut` to minimize allocations;
/// extracted frames are zero-copy slices of it.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_length: usize,
}

impl FrameBuffer {
    /// Create a frame buffer accepting frames up to [`MAX_FRAME_LENGTH`].
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    /// Create a frame buffer with a custom frame size bound.
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_length: max_frame_length.min(MAX_FRAME_LENGTH),
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns an error when a prefix announces a frame larger than the
    /// configured bound or a zero-length frame.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let length = ((self.buffer[0] as usize) << 16)
                    | ((self.buffer[1] as usize) << 8)
                    | (self.buffer[2] as usize);
                if length == 0 {
                    return Err(RSocketError::InvalidFrame(
                        "zero-length frame".to_string(),
                    ));
                }
                if length > self.max_frame_length {
                    return Err(RSocketError::InvalidFrame(format!(
                        "frame of {} bytes exceeds the {}-byte limit",
                        length, self.max_frame_length
                    )));
                }

                let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);
                self.state = State::WaitingForFrame { remaining: length };
                self.try_extract_one()
            }
            State::WaitingForFrame { remaining } => {
                if self.buffer.len() < remaining {
                    return Ok(None);
                }
                let frame = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(frame))
            }
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode the 3-byte length prefix for a frame.
///
/// Fails when the frame exceeds [`MAX_FRAME_LENGTH`] or is empty.
pub fn length_prefix(frame: &[u8]) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
    if frame.is_empty() {
        return Err(RSocketError::InvalidFrame("zero-length frame".to_string()));
    }
    if frame.len() > MAX_FRAME_LENGTH {
        return Err(RSocketError::InvalidFrame(format!(
            "frame of {} bytes exceeds the {}-byte limit",
            frame.len(),
            MAX_FRAME_LENGTH
        )));
    }
    let len = frame.len();
    Ok([(len >> 16) as u8, (len >> 8) as u8, len as u8])
}

/// Build a prefixed wire buffer for a frame.
pub fn prefix_frame(frame: &[u8]) -> Result<Bytes> {
    let prefix = length_prefix(frame)?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
    buf.put_slice(&prefix);
    buf.put_slice(frame);
    Ok(buf.freeze())
}
