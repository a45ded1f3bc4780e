//! Frame header encoding and decoding.
//!
//! Implements the 6-byte RSocket frame header:
//! ```text
//! ┌──────────────────┬────────────┬────────────┐
//! │ Stream ID        │ Frame Type │ Flags      │
//! │ 4 bytes          │ 6 bits     │ 10 bits    │
//! │ uint31 BE        │            │            │
//! └──────────────────┴────────────┴────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The high bit of the stream id
//! word is reserved and must be 0.

use crate::error::{RSocketError, Result};

/// Header size in bytes (fixed, exactly 6).
pub const HEADER_SIZE: usize = 6;

/// Stream identifier: unsigned 31-bit integer, 0 reserved for the connection.
pub type StreamId = u32;

/// Stream id reserved for connection-level frames.
pub const CONNECTION_STREAM_ID: StreamId = 0;

/// Largest representable stream id (31 bits).
pub const MAX_STREAM_ID: StreamId = 0x7FFF_FFFF;

/// Frame type codes, 6 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Connection setup, first frame from a client.
    Setup,
    /// Lease grant from the responder.
    Lease,
    /// Connection liveness probe.
    Keepalive,
    /// Request a single response.
    RequestResponse,
    /// Fire-and-forget request, no response expected.
    RequestFnf,
    /// Request a stream of responses.
    RequestStream,
    /// Request a bidirectional channel.
    RequestChannel,
    /// Grant more items to the peer (flow control).
    RequestN,
    /// Cancel an outstanding request.
    Cancel,
    /// Payload on an established stream.
    Payload,
    /// Error, connection-level on stream 0, stream-level otherwise.
    Error,
    /// Metadata push at the connection level.
    MetadataPush,
    /// Resume a previous session, first frame of a reconnect.
    Resume,
    /// Resume accepted.
    ResumeOk,
    /// Extension frame.
    Ext,
}

impl FrameType {
    /// Wire value (6 bits).
    pub fn to_u8(self) -> u8 {
        match self {
            FrameType::Setup => 0x01,
            FrameType::Lease => 0x02,
            FrameType::Keepalive => 0x03,
            FrameType::RequestResponse => 0x04,
            FrameType::RequestFnf => 0x05,
            FrameType::RequestStream => 0x06,
            FrameType::RequestChannel => 0x07,
            FrameType::RequestN => 0x08,
            FrameType::Cancel => 0x09,
            FrameType::Payload => 0x0A,
            FrameType::Error => 0x0B,
            FrameType::MetadataPush => 0x0C,
            FrameType::Resume => 0x0D,
            FrameType::ResumeOk => 0x0E,
            FrameType::Ext => 0x3F,
        }
    }

    /// Decode a wire value. Returns `None` for reserved or unknown codes.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => FrameType::Setup,
            0x02 => FrameType::Lease,
            0x03 => FrameType::Keepalive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => FrameType::Payload,
            0x0B => FrameType::Error,
            0x0C => FrameType::MetadataPush,
            0x0D => FrameType::Resume,
            0x0E => FrameType::ResumeOk,
            0x3F => FrameType::Ext,
            _ => return None,
        })
    }

    /// Whether this type opens a new stream when it arrives on an unknown id.
    pub fn is_new_stream_frame(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
        )
    }

    /// Whether frames of this type advance resume positions.
    ///
    /// Handshake and liveness frames (SETUP, RESUME, RESUME_OK, KEEPALIVE,
    /// LEASE, METADATA_PUSH, EXT) are replayed never; everything that carries
    /// stream state is.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::RequestN
                | FrameType::Cancel
                | FrameType::Payload
                | FrameType::Error
        )
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameType::Setup => "SETUP",
            FrameType::Lease => "LEASE",
            FrameType::Keepalive => "KEEPALIVE",
            FrameType::RequestResponse => "REQUEST_RESPONSE",
            FrameType::RequestFnf => "REQUEST_FNF",
            FrameType::RequestStream => "REQUEST_STREAM",
            FrameType::RequestChannel => "REQUEST_CHANNEL",
            FrameType::RequestN => "REQUEST_N",
            FrameType::Cancel => "CANCEL",
            FrameType::Payload => "PAYLOAD",
            FrameType::Error => "ERROR",
            FrameType::MetadataPush => "METADATA_PUSH",
            FrameType::Resume => "RESUME",
            FrameType::ResumeOk => "RESUME_OK",
            FrameType::Ext => "EXT",
        };
        f.write_str(name)
    }
}

/// Flag constants, 10 bits on the wire.
pub mod flags {
    /// Receiver may ignore the frame if the type is unknown.
    pub const IGNORE: u16 = 0x200;
    /// The frame carries length-prefixed metadata.
    pub const METADATA: u16 = 0x100;
    /// SETUP: client requests a resumable session.
    pub const RESUME_ENABLE: u16 = 0x80;
    /// SETUP: client honors LEASE frames.
    pub const LEASE: u16 = 0x40;
    /// KEEPALIVE: respond with a KEEPALIVE of your own.
    pub const RESPOND: u16 = 0x80;
    /// More fragments of this logical frame follow.
    pub const FOLLOWS: u16 = 0x80;
    /// PAYLOAD / REQUEST_CHANNEL: terminal completion of the stream.
    pub const COMPLETE: u16 = 0x40;
    /// PAYLOAD: the frame carries a next element.
    pub const NEXT: u16 = 0x20;

    /// Mask of the 10 flag bits.
    pub const MASK: u16 = 0x3FF;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream this frame belongs to; 0 for connection-level frames.
    pub stream_id: StreamId,
    /// Frame type (6 bits).
    pub frame_type: FrameType,
    /// Flags (10 bits).
    pub flags: u16,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(stream_id: StreamId, frame_type: FrameType, flags: u16) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: flags & flags::MASK,
        }
    }

    /// Encode the header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&(self.stream_id & MAX_STREAM_ID).to_be_bytes());
        let type_and_flags = ((self.frame_type.to_u8() as u16) << 10) | (self.flags & flags::MASK);
        buf[4..6].copy_from_slice(&type_and_flags.to_be_bytes());
        buf
    }

    /// Decode a header from the start of a frame buffer.
    ///
    /// Fails when the buffer is short, the reserved stream id bit is set, or
    /// the frame type code is unknown (unless the IGNORE flag is set, which
    /// still fails here but lets the caller distinguish via
    /// [`peek_type_code`]).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(RSocketError::InvalidFrame(format!(
                "frame of {} bytes is shorter than the {}-byte header",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let stream_id_raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if stream_id_raw & 0x8000_0000 != 0 {
            return Err(RSocketError::InvalidFrame(
                "reserved stream id bit is set".to_string(),
            ));
        }
        let type_and_flags = u16::from_be_bytes([buf[4], buf[5]]);
        let type_code = (type_and_flags >> 10) as u8;
        let frame_type = FrameType::from_u8(type_code).ok_or_else(|| {
            RSocketError::InvalidFrame(format!("unknown frame type {:#x}", type_code))
        })?;
        Ok(Self {
            stream_id: stream_id_raw,
            frame_type,
            flags: type_and_flags & flags::MASK,
        })
    }

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(&self, flag: u16) -> bool {
        flags::has_flag(self.flags, flag)
    }
}

/// Raw type code of a frame buffer, without validating it.
pub fn peek_type_code(buf: &[u8]) -> Option<u8> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    Some((u16::from_be_bytes([buf[4], buf[5]]) >> 10) as u8)
}
