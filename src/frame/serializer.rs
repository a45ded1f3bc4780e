//! Bit-exact frame encoding and decoding for RSocket protocol version 1.0.
//!
//! The serializer works on complete frame buffers with the transport length
//! prefix already stripped (see [`crate::transport::framing`]). All
//! multi-byte integers are Big Endian; metadata, when present, is prefixed
//! by a 24-bit length except in METADATA_PUSH, KEEPALIVE, LEASE and ERROR
//! frames where it occupies the remainder of the frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, RSocketError, Result};
use crate::setup::{ProtocolVersion, ResumeToken};

use super::frame::{
    CancelFrame, ErrorFrame, ExtFrame, Frame, KeepaliveFrame, LeaseFrame, MetadataPushFrame,
    Payload, PayloadFrame, RequestChannelFrame, RequestFnfFrame, RequestNFrame,
    RequestResponseFrame, RequestStreamFrame, ResumeFrame, ResumeOkFrame, SetupFrame,
};
use super::header::{flags, FrameHeader, FrameType, HEADER_SIZE};

/// Largest value of 31-bit wire integers (request n, keepalive times).
pub const MAX_U31: u32 = 0x7FFF_FFFF;

/// Largest metadata length expressible in the 24-bit prefix.
pub const MAX_METADATA_LENGTH: usize = 0xFF_FFFF;

/// Versioned frame codec.
///
/// Constructed either from a configured version or via
/// [`FrameSerializer::detect_version`] on the first inbound frame.
#[derive(Debug, Clone)]
pub struct FrameSerializer {
    version: ProtocolVersion,
}

impl FrameSerializer {
    /// Create a serializer for the given version.
    ///
    /// Fails with [`RSocketError::UnsupportedSetup`] for versions this build
    /// does not speak.
    pub fn new(version: ProtocolVersion) -> Result<Self> {
        if !version.is_supported() {
            return Err(RSocketError::UnsupportedSetup(format!(
                "protocol version {} is not supported",
                version
            )));
        }
        Ok(Self { version })
    }

    /// The protocol version this serializer speaks.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Probe the first inbound frame of a connection for its protocol
    /// version.
    ///
    /// Only SETUP and RESUME frames carry a version; anything else fails
    /// detection. Detection must never be re-run after the first frame.
    pub fn detect_version(first_frame: &[u8]) -> Option<ProtocolVersion> {
        let header = FrameHeader::decode(first_frame).ok()?;
        match header.frame_type {
            FrameType::Setup | FrameType::Resume => {
                if first_frame.len() < HEADER_SIZE + 4 {
                    return None;
                }
                let major =
                    u16::from_be_bytes([first_frame[HEADER_SIZE], first_frame[HEADER_SIZE + 1]]);
                let minor = u16::from_be_bytes([
                    first_frame[HEADER_SIZE + 2],
                    first_frame[HEADER_SIZE + 3],
                ]);
                let version = ProtocolVersion { major, minor };
                version.is_supported().then_some(version)
            }
            _ => None,
        }
    }

    /// Header-only peek into a frame buffer.
    pub fn peek_header(frame: &[u8]) -> Result<FrameHeader> {
        FrameHeader::decode(frame)
    }

    /// Encode a frame into a contiguous buffer (without length prefix).
    pub fn serialize(&self, frame: &Frame) -> Result<Bytes> {
        let header = FrameHeader::new(frame.stream_id(), frame.frame_type(), frame.wire_flags());
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.put_slice(&header.encode());

        match frame {
            Frame::Setup(f) => encode_setup(&mut buf, f)?,
            Frame::Lease(f) => {
                put_u31(&mut buf, f.ttl_ms, "lease ttl")?;
                put_u31(&mut buf, f.number_of_requests, "lease request count")?;
                if let Some(metadata) = &f.metadata {
                    buf.put_slice(metadata);
                }
            }
            Frame::Keepalive(f) => {
                put_u63(&mut buf, f.last_received_position, "keepalive position")?;
                buf.put_slice(&f.data);
            }
            Frame::RequestResponse(f) => encode_payload(&mut buf, &f.payload)?,
            Frame::RequestFnf(f) => encode_payload(&mut buf, &f.payload)?,
            Frame::RequestStream(f) => {
                put_u31(&mut buf, f.initial_request_n, "initial request n")?;
                encode_payload(&mut buf, &f.payload)?;
            }
            Frame::RequestChannel(f) => {
                put_u31(&mut buf, f.initial_request_n, "initial request n")?;
                encode_payload(&mut buf, &f.payload)?;
            }
            Frame::RequestN(f) => put_u31(&mut buf, f.request_n, "request n")?,
            Frame::Cancel(_) => {}
            Frame::Payload(f) => encode_payload(&mut buf, &f.payload)?,
            Frame::Error(f) => {
                buf.put_u32(f.code.to_u32());
                buf.put_slice(&f.data);
            }
            Frame::MetadataPush(f) => buf.put_slice(&f.metadata),
            Frame::Resume(f) => {
                buf.put_u16(f.version.major);
                buf.put_u16(f.version.minor);
                buf.put_u16(f.token.len() as u16);
                buf.put_slice(f.token.as_bytes());
                put_u63(&mut buf, f.last_received_server_position, "resume position")?;
                put_u63(&mut buf, f.first_client_position, "resume position")?;
            }
            Frame::ResumeOk(f) => put_u63(&mut buf, f.position, "resume position")?,
            Frame::Ext(f) => {
                buf.put_u32(f.extended_type);
                encode_payload(&mut buf, &f.payload)?;
            }
        }

        Ok(buf.freeze())
    }

    /// Decode a complete frame buffer into its typed variant.
    pub fn deserialize(&self, mut buf: Bytes) -> Result<Frame> {
        let header = FrameHeader::decode(&buf)?;
        let connection_level = matches!(
            header.frame_type,
            FrameType::Setup
                | FrameType::Lease
                | FrameType::Keepalive
                | FrameType::MetadataPush
                | FrameType::Resume
                | FrameType::ResumeOk
        );
        if connection_level && header.stream_id != 0 {
            return Err(RSocketError::InvalidFrame(format!(
                "{} frame on stream {}",
                header.frame_type, header.stream_id
            )));
        }
        buf.advance(HEADER_SIZE);

        let frame = match header.frame_type {
            FrameType::Setup => Frame::Setup(decode_setup(&header, &mut buf)?),
            FrameType::Lease => {
                let ttl_ms = get_u31(&mut buf, "lease ttl")?;
                let number_of_requests = get_u31(&mut buf, "lease request count")?;
                let metadata = header
                    .has_flag(flags::METADATA)
                    .then(|| buf.copy_to_bytes(buf.remaining()));
                Frame::Lease(LeaseFrame {
                    ttl_ms,
                    number_of_requests,
                    metadata,
                })
            }
            FrameType::Keepalive => {
                let last_received_position = get_u63(&mut buf, "keepalive position")?;
                Frame::Keepalive(KeepaliveFrame {
                    respond: header.has_flag(flags::RESPOND),
                    last_received_position,
                    data: buf.copy_to_bytes(buf.remaining()),
                })
            }
            FrameType::RequestResponse => Frame::RequestResponse(RequestResponseFrame {
                stream_id: header.stream_id,
                follows: header.has_flag(flags::FOLLOWS),
                payload: decode_payload(&header, &mut buf)?,
            }),
            FrameType::RequestFnf => Frame::RequestFnf(RequestFnfFrame {
                stream_id: header.stream_id,
                follows: header.has_flag(flags::FOLLOWS),
                payload: decode_payload(&header, &mut buf)?,
            }),
            FrameType::RequestStream => {
                let initial_request_n = get_u31(&mut buf, "initial request n")?;
                Frame::RequestStream(RequestStreamFrame {
                    stream_id: header.stream_id,
                    follows: header.has_flag(flags::FOLLOWS),
                    initial_request_n,
                    payload: decode_payload(&header, &mut buf)?,
                })
            }
            FrameType::RequestChannel => {
                let initial_request_n = get_u31(&mut buf, "initial request n")?;
                Frame::RequestChannel(RequestChannelFrame {
                    stream_id: header.stream_id,
                    follows: header.has_flag(flags::FOLLOWS),
                    complete: header.has_flag(flags::COMPLETE),
                    initial_request_n,
                    payload: decode_payload(&header, &mut buf)?,
                })
            }
            FrameType::RequestN => {
                let request_n = get_u31(&mut buf, "request n")?;
                if request_n == 0 {
                    return Err(RSocketError::InvalidFrame(
                        "request n must be positive".to_string(),
                    ));
                }
                Frame::RequestN(RequestNFrame {
                    stream_id: header.stream_id,
                    request_n,
                })
            }
            FrameType::Cancel => Frame::Cancel(CancelFrame {
                stream_id: header.stream_id,
            }),
            FrameType::Payload => Frame::Payload(PayloadFrame {
                stream_id: header.stream_id,
                follows: header.has_flag(flags::FOLLOWS),
                complete: header.has_flag(flags::COMPLETE),
                next: header.has_flag(flags::NEXT),
                payload: decode_payload(&header, &mut buf)?,
            }),
            FrameType::Error => {
                ensure(&buf, 4, "error code")?;
                let code = ErrorCode::from_u32(buf.get_u32());
                Frame::Error(ErrorFrame {
                    stream_id: header.stream_id,
                    code,
                    data: buf.copy_to_bytes(buf.remaining()),
                })
            }
            FrameType::MetadataPush => {
                if !header.has_flag(flags::METADATA) {
                    return Err(RSocketError::InvalidFrame(
                        "METADATA_PUSH without metadata flag".to_string(),
                    ));
                }
                Frame::MetadataPush(MetadataPushFrame {
                    metadata: buf.copy_to_bytes(buf.remaining()),
                })
            }
            FrameType::Resume => {
                ensure(&buf, 4, "resume version")?;
                let version = ProtocolVersion {
                    major: buf.get_u16(),
                    minor: buf.get_u16(),
                };
                ensure(&buf, 2, "resume token length")?;
                let token_len = buf.get_u16() as usize;
                ensure(&buf, token_len, "resume token")?;
                let token = ResumeToken::new(buf.copy_to_bytes(token_len))?;
                let last_received_server_position = get_u63(&mut buf, "resume position")?;
                let first_client_position = get_u63(&mut buf, "resume position")?;
                Frame::Resume(ResumeFrame {
                    version,
                    token,
                    last_received_server_position,
                    first_client_position,
                })
            }
            FrameType::ResumeOk => Frame::ResumeOk(ResumeOkFrame {
                position: get_u63(&mut buf, "resume position")?,
            }),
            FrameType::Ext => {
                ensure(&buf, 4, "extension type")?;
                let extended_type = buf.get_u32();
                Frame::Ext(ExtFrame {
                    stream_id: header.stream_id,
                    extended_type,
                    can_ignore: header.has_flag(flags::IGNORE),
                    payload: decode_payload(&header, &mut buf)?,
                })
            }
        };

        Ok(frame)
    }
}

fn encode_setup(buf: &mut BytesMut, f: &SetupFrame) -> Result<()> {
    if f.keepalive_interval_ms == 0 || f.max_lifetime_ms == 0 {
        return Err(RSocketError::InvalidFrame(
            "keepalive interval and max lifetime must be positive".to_string(),
        ));
    }
    buf.put_u16(f.version.major);
    buf.put_u16(f.version.minor);
    put_u31(buf, f.keepalive_interval_ms, "keepalive interval")?;
    put_u31(buf, f.max_lifetime_ms, "max lifetime")?;
    if let Some(token) = &f.token {
        buf.put_u16(token.len() as u16);
        buf.put_slice(token.as_bytes());
    }
    put_mime(buf, &f.metadata_mime_type)?;
    put_mime(buf, &f.data_mime_type)?;
    encode_payload(buf, &f.payload)
}

fn decode_setup(header: &FrameHeader, buf: &mut Bytes) -> Result<SetupFrame> {
    ensure(buf, 4, "setup version")?;
    let version = ProtocolVersion {
        major: buf.get_u16(),
        minor: buf.get_u16(),
    };
    let keepalive_interval_ms = get_u31(buf, "keepalive interval")?;
    let max_lifetime_ms = get_u31(buf, "max lifetime")?;
    if keepalive_interval_ms == 0 || max_lifetime_ms == 0 {
        return Err(RSocketError::InvalidFrame(
            "keepalive interval and max lifetime must be positive".to_string(),
        ));
    }
    let token = if header.has_flag(flags::RESUME_ENABLE) {
        ensure(buf, 2, "resume token length")?;
        let token_len = buf.get_u16() as usize;
        ensure(buf, token_len, "resume token")?;
        Some(ResumeToken::new(buf.copy_to_bytes(token_len))?)
    } else {
        None
    };
    let metadata_mime_type = get_mime(buf)?;
    let data_mime_type = get_mime(buf)?;
    Ok(SetupFrame {
        version,
        keepalive_interval_ms,
        max_lifetime_ms,
        token,
        lease: header.has_flag(flags::LEASE),
        metadata_mime_type,
        data_mime_type,
        payload: decode_payload(header, buf)?,
    })
}

fn encode_payload(buf: &mut BytesMut, payload: &Payload) -> Result<()> {
    if let Some(metadata) = &payload.metadata {
        if metadata.len() > MAX_METADATA_LENGTH {
            return Err(RSocketError::InvalidFrame(format!(
                "metadata of {} bytes exceeds the 24-bit length prefix",
                metadata.len()
            )));
        }
        put_u24(buf, metadata.len() as u32);
        buf.put_slice(metadata);
    }
    buf.put_slice(&payload.data);
    Ok(())
}

fn decode_payload(header: &FrameHeader, buf: &mut Bytes) -> Result<Payload> {
    let metadata = if header.has_flag(flags::METADATA) {
        ensure(buf, 3, "metadata length")?;
        let len = get_u24(buf) as usize;
        ensure(buf, len, "metadata")?;
        Some(buf.copy_to_bytes(len))
    } else {
        None
    };
    let data = buf.copy_to_bytes(buf.remaining());
    Ok(Payload { metadata, data })
}

fn put_mime(buf: &mut BytesMut, mime: &str) -> Result<()> {
    if mime.is_empty() || mime.len() > u8::MAX as usize {
        return Err(RSocketError::InvalidFrame(format!(
            "mime type length {} outside 1..=255",
            mime.len()
        )));
    }
    buf.put_u8(mime.len() as u8);
    buf.put_slice(mime.as_bytes());
    Ok(())
}

fn get_mime(buf: &mut Bytes) -> Result<String> {
    ensure(buf, 1, "mime length")?;
    let len = buf.get_u8() as usize;
    ensure(buf, len, "mime type")?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| RSocketError::InvalidFrame("mime type is not UTF-8".to_string()))
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

fn get_u24(buf: &mut Bytes) -> u32 {
    let hi = buf.get_u8() as u32;
    let mid = buf.get_u8() as u32;
    let lo = buf.get_u8() as u32;
    (hi << 16) | (mid << 8) | lo
}

fn put_u31(buf: &mut BytesMut, value: u32, what: &str) -> Result<()> {
    if value > MAX_U31 {
        return Err(RSocketError::InvalidFrame(format!(
            "{} {} exceeds 31 bits",
            what, value
        )));
    }
    buf.put_u32(value);
    Ok(())
}

fn get_u31(buf: &mut Bytes, what: &str) -> Result<u32> {
    ensure(buf, 4, what)?;
    let value = buf.get_u32();
    if value > MAX_U31 {
        return Err(RSocketError::InvalidFrame(format!(
            "{} has the reserved high bit set",
            what
        )));
    }
    Ok(value)
}

fn put_u63(buf: &mut BytesMut, value: u64, what: &str) -> Result<()> {
    if value > i64::MAX as u64 {
        return Err(RSocketError::InvalidFrame(format!(
            "{} {} exceeds 63 bits",
            what, value
        )));
    }
    buf.put_u64(value);
    Ok(())
}

fn get_u63(buf: &mut Bytes, what: &str) -> Result<u64> {
    ensure(buf, 8, what)?;
    let value = buf.get_u64();
    if value > i64::MAX as u64 {
        return Err(RSocketError::InvalidFrame(format!(
            "{} has the reserved high bit set",
            what
        )));
    }
    Ok(value)
}

fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(RSocketError::InvalidFrame(format!(
            "truncated frame: {} more bytes needed for {}",
            needed - buf.remaining(),
            what
        )));
    }
    Ok(())
}
