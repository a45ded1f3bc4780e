//! Frame model: payload and the tagged sum of all frame variants.
//!
//! A [`Frame`] is the decoded, typed view of one wire frame. Encoding and
//! decoding live in [`super::serializer`]; this module only carries the
//! data and the invariants that do not depend on the wire layout.

use bytes::Bytes;

use crate::error::{ErrorCode, RSocketError, Result};
use crate::setup::{ProtocolVersion, ResumeToken};

use super::header::{flags, FrameType, StreamId, CONNECTION_STREAM_ID};

/// A logical payload: optional metadata plus data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Metadata bytes, typed by the SETUP metadata mime type.
    pub metadata: Option<Bytes>,
    /// Data bytes, typed by the SETUP data mime type.
    pub data: Bytes,
}

impl Payload {
    /// Create a payload with metadata and data.
    pub fn new(metadata: Option<Bytes>, data: Bytes) -> Self {
        Self { metadata, data }
    }

    /// Create a data-only payload.
    pub fn from_data(data: Bytes) -> Self {
        Self {
            metadata: None,
            data,
        }
    }

    /// Create a data-only payload from a static string.
    pub fn from_static(data: &'static str) -> Self {
        Self::from_data(Bytes::from_static(data.as_bytes()))
    }

    /// Whether both metadata and data are absent.
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.data.is_empty()
    }

    /// Total byte length of metadata and data.
    pub fn len(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.len()) + self.data.len()
    }
}

/// SETUP frame: first frame from a client, stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupFrame {
    /// Negotiated protocol version.
    pub version: ProtocolVersion,
    /// Keepalive interval in milliseconds (31-bit).
    pub keepalive_interval_ms: u32,
    /// Max lifetime in milliseconds (31-bit).
    pub max_lifetime_ms: u32,
    /// Resume token; presence sets the RESUME_ENABLE flag.
    pub token: Option<ResumeToken>,
    /// Whether the client honors LEASE frames.
    pub lease: bool,
    /// Mime type of metadata payloads.
    pub metadata_mime_type: String,
    /// Mime type of data payloads.
    pub data_mime_type: String,
    /// Setup payload.
    pub payload: Payload,
}

/// LEASE frame: responder grants a request budget, stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFrame {
    /// Validity of the lease in milliseconds (31-bit).
    pub ttl_ms: u32,
    /// Number of requests granted (31-bit).
    pub number_of_requests: u32,
    /// Optional lease metadata.
    pub metadata: Option<Bytes>,
}

/// KEEPALIVE frame, stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveFrame {
    /// Whether the receiver must echo a KEEPALIVE back.
    pub respond: bool,
    /// Resume position of the last frame received by the sender.
    pub last_received_position: u64,
    /// Opaque keepalive data, echoed back verbatim.
    pub data: Bytes,
}

/// REQUEST_RESPONSE frame: open a single-response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResponseFrame {
    /// Stream id (non-zero).
    pub stream_id: StreamId,
    /// More fragments of the request follow.
    pub follows: bool,
    /// Request payload.
    pub payload: Payload,
}

/// REQUEST_FNF frame: fire-and-forget request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFnfFrame {
    /// Stream id (non-zero).
    pub stream_id: StreamId,
    /// More fragments of the request follow.
    pub follows: bool,
    /// Request payload.
    pub payload: Payload,
}

/// REQUEST_STREAM frame: open a response-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestStreamFrame {
    /// Stream id (non-zero).
    pub stream_id: StreamId,
    /// More fragments of the request follow.
    pub follows: bool,
    /// Initial request(n) allowance (31-bit).
    pub initial_request_n: u32,
    /// Request payload.
    pub payload: Payload,
}

/// REQUEST_CHANNEL frame: open a bidirectional stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestChannelFrame {
    /// Stream id (non-zero).
    pub stream_id: StreamId,
    /// More fragments of the request follow.
    pub follows: bool,
    /// The requester's outbound direction is already complete.
    pub complete: bool,
    /// Initial request(n) allowance (31-bit).
    pub initial_request_n: u32,
    /// Request payload.
    pub payload: Payload,
}

/// REQUEST_N frame: grant more items to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestNFrame {
    /// Stream id (non-zero).
    pub stream_id: StreamId,
    /// Additional allowance (31-bit, positive).
    pub request_n: u32,
}

/// CANCEL frame: abort an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelFrame {
    /// Stream id (non-zero).
    pub stream_id: StreamId,
}

/// PAYLOAD frame: element, completion, or fragment continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFrame {
    /// Stream id (non-zero).
    pub stream_id: StreamId,
    /// More fragments of this logical frame follow.
    pub follows: bool,
    /// Terminal completion of the stream.
    pub complete: bool,
    /// The frame carries an element.
    pub next: bool,
    /// Element payload.
    pub payload: Payload,
}

impl PayloadFrame {
    /// A bare completion frame: COMPLETE set, no element.
    pub fn complete(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            follows: false,
            complete: true,
            next: false,
            payload: Payload::default(),
        }
    }

    /// An element frame: NEXT set.
    pub fn next(stream_id: StreamId, payload: Payload) -> Self {
        Self {
            stream_id,
            follows: false,
            complete: false,
            next: true,
            payload,
        }
    }

    /// An element plus completion: NEXT and COMPLETE set.
    pub fn next_complete(stream_id: StreamId, payload: Payload) -> Self {
        Self {
            stream_id,
            follows: false,
            complete: true,
            next: true,
            payload,
        }
    }
}

/// ERROR frame: connection-level on stream 0, stream-level otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    /// Stream id; 0 for connection errors.
    pub stream_id: StreamId,
    /// Wire error code.
    pub code: ErrorCode,
    /// UTF-8 error data.
    pub data: Bytes,
}

impl ErrorFrame {
    /// INVALID_SETUP at the connection level.
    pub fn invalid_setup(message: &str) -> Self {
        Self::connection_err(ErrorCode::InvalidSetup, message)
    }

    /// UNSUPPORTED_SETUP at the connection level.
    pub fn unsupported_setup(message: &str) -> Self {
        Self::connection_err(ErrorCode::UnsupportedSetup, message)
    }

    /// REJECTED_SETUP at the connection level.
    pub fn rejected_setup(message: &str) -> Self {
        Self::connection_err(ErrorCode::RejectedSetup, message)
    }

    /// REJECTED_RESUME at the connection level.
    pub fn rejected_resume(message: &str) -> Self {
        Self::connection_err(ErrorCode::RejectedResume, message)
    }

    /// CONNECTION_ERROR at the connection level.
    pub fn connection_error(message: &str) -> Self {
        Self::connection_err(ErrorCode::ConnectionError, message)
    }

    /// APPLICATION_ERROR for a stream. Fails for stream 0.
    pub fn application_error(stream_id: StreamId, message: &str) -> Result<Self> {
        Self::stream_err(ErrorCode::ApplicationError, message, stream_id)
    }

    /// REJECTED for a stream. Fails for stream 0.
    pub fn rejected(stream_id: StreamId, message: &str) -> Result<Self> {
        Self::stream_err(ErrorCode::Rejected, message, stream_id)
    }

    /// CANCELED for a stream. Fails for stream 0.
    pub fn canceled(stream_id: StreamId, message: &str) -> Result<Self> {
        Self::stream_err(ErrorCode::Canceled, message, stream_id)
    }

    /// INVALID for a stream. Fails for stream 0.
    pub fn invalid(stream_id: StreamId, message: &str) -> Result<Self> {
        Self::stream_err(ErrorCode::Invalid, message, stream_id)
    }

    /// UTF-8 decoded error data.
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    fn connection_err(code: ErrorCode, message: &str) -> Self {
        Self {
            stream_id: CONNECTION_STREAM_ID,
            code,
            data: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    fn stream_err(code: ErrorCode, message: &str, stream_id: StreamId) -> Result<Self> {
        if stream_id == CONNECTION_STREAM_ID {
            return Err(RSocketError::ReservedStreamId);
        }
        Ok(Self {
            stream_id,
            code,
            data: Bytes::copy_from_slice(message.as_bytes()),
        })
    }
}

/// METADATA_PUSH frame: connection-level metadata, stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPushFrame {
    /// Metadata bytes.
    pub metadata: Bytes,
}

/// RESUME frame: first frame of a reconnect, stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFrame {
    /// Protocol version the client resumes with.
    pub version: ProtocolVersion,
    /// Session token.
    pub token: ResumeToken,
    /// Last server position the client received.
    pub last_received_server_position: u64,
    /// Earliest position the client can still replay from.
    pub first_client_position: u64,
}

/// RESUME_OK frame: resume accepted, stream 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeOkFrame {
    /// Last client position the server received.
    pub position: u64,
}

/// EXT frame: extension, ignored unless an extension is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtFrame {
    /// Stream id.
    pub stream_id: StreamId,
    /// Extension type discriminator.
    pub extended_type: u32,
    /// Receiver may ignore the frame.
    pub can_ignore: bool,
    /// Extension payload.
    pub payload: Payload,
}

/// Tagged sum of all frame variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// SETUP frame.
    Setup(SetupFrame),
    /// LEASE frame.
    Lease(LeaseFrame),
    /// KEEPALIVE frame.
    Keepalive(KeepaliveFrame),
    /// REQUEST_RESPONSE frame.
    RequestResponse(RequestResponseFrame),
    /// REQUEST_FNF frame.
    RequestFnf(RequestFnfFrame),
    /// REQUEST_STREAM frame.
    RequestStream(RequestStreamFrame),
    /// REQUEST_CHANNEL frame.
    RequestChannel(RequestChannelFrame),
    /// REQUEST_N frame.
    RequestN(RequestNFrame),
    /// CANCEL frame.
    Cancel(CancelFrame),
    /// PAYLOAD frame.
    Payload(PayloadFrame),
    /// ERROR frame.
    Error(ErrorFrame),
    /// METADATA_PUSH frame.
    MetadataPush(MetadataPushFrame),
    /// RESUME frame.
    Resume(ResumeFrame),
    /// RESUME_OK frame.
    ResumeOk(ResumeOkFrame),
    /// EXT frame.
    Ext(ExtFrame),
}

impl Frame {
    /// Stream the frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Setup(_)
            | Frame::Lease(_)
            | Frame::Keepalive(_)
            | Frame::MetadataPush(_)
            | Frame::Resume(_)
            | Frame::ResumeOk(_) => CONNECTION_STREAM_ID,
            Frame::RequestResponse(f) => f.stream_id,
            Frame::RequestFnf(f) => f.stream_id,
            Frame::RequestStream(f) => f.stream_id,
            Frame::RequestChannel(f) => f.stream_id,
            Frame::RequestN(f) => f.stream_id,
            Frame::Cancel(f) => f.stream_id,
            Frame::Payload(f) => f.stream_id,
            Frame::Error(f) => f.stream_id,
            Frame::Ext(f) => f.stream_id,
        }
    }

    /// Wire frame type of the variant.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Setup(_) => FrameType::Setup,
            Frame::Lease(_) => FrameType::Lease,
            Frame::Keepalive(_) => FrameType::Keepalive,
            Frame::RequestResponse(_) => FrameType::RequestResponse,
            Frame::RequestFnf(_) => FrameType::RequestFnf,
            Frame::RequestStream(_) => FrameType::RequestStream,
            Frame::RequestChannel(_) => FrameType::RequestChannel,
            Frame::RequestN(_) => FrameType::RequestN,
            Frame::Cancel(_) => FrameType::Cancel,
            Frame::Payload(_) => FrameType::Payload,
            Frame::Error(_) => FrameType::Error,
            Frame::MetadataPush(_) => FrameType::MetadataPush,
            Frame::Resume(_) => FrameType::Resume,
            Frame::ResumeOk(_) => FrameType::ResumeOk,
            Frame::Ext(_) => FrameType::Ext,
        }
    }

    /// Whether this frame advances resume positions.
    ///
    /// Connection-level ERROR frames accompany closure and are never
    /// replayed; stream-level ERROR frames are.
    pub fn is_resumable(&self) -> bool {
        match self {
            Frame::Error(f) => f.stream_id != CONNECTION_STREAM_ID,
            other => other.frame_type().is_resumable(),
        }
    }

    /// FOLLOWS flag of request and payload frames; false elsewhere.
    pub fn follows(&self) -> bool {
        match self {
            Frame::RequestResponse(f) => f.follows,
            Frame::RequestFnf(f) => f.follows,
            Frame::RequestStream(f) => f.follows,
            Frame::RequestChannel(f) => f.follows,
            Frame::Payload(f) => f.follows,
            _ => false,
        }
    }

    /// Flags word as it would appear on the wire.
    pub fn wire_flags(&self) -> u16 {
        let mut value = 0u16;
        match self {
            Frame::Setup(f) => {
                if f.payload.metadata.is_some() {
                    value |= flags::METADATA;
                }
                if f.token.is_some() {
                    value |= flags::RESUME_ENABLE;
                }
                if f.lease {
                    value |= flags::LEASE;
                }
            }
            Frame::Lease(f) => {
                if f.metadata.is_some() {
                    value |= flags::METADATA;
                }
            }
            Frame::Keepalive(f) => {
                if f.respond {
                    value |= flags::RESPOND;
                }
            }
            Frame::RequestResponse(f) => {
                if f.payload.metadata.is_some() {
                    value |= flags::METADATA;
                }
                if f.follows {
                    value |= flags::FOLLOWS;
                }
            }
            Frame::RequestFnf(f) => {
                if f.payload.metadata.is_some() {
                    value |= flags::METADATA;
                }
                if f.follows {
                    value |= flags::FOLLOWS;
                }
            }
            Frame::RequestStream(f) => {
                if f.payload.metadata.is_some() {
                    value |= flags::METADATA;
                }
                if f.follows {
                    value |= flags::FOLLOWS;
                }
            }
            Frame::RequestChannel(f) => {
                if f.payload.metadata.is_some() {
                    value |= flags::METADATA;
                }
                if f.follows {
                    value |= flags::FOLLOWS;
                }
                if f.complete {
                    value |= flags::COMPLETE;
                }
            }
            Frame::RequestN(_) | Frame::Cancel(_) | Frame::Error(_) | Frame::ResumeOk(_) => {}
            Frame::Payload(f) => {
                if f.payload.metadata.is_some() {
                    value |= flags::METADATA;
                }
                if f.follows {
                    value |= flags::FOLLOWS;
                }
                if f.complete {
                    value |= flags::COMPLETE;
                }
                if f.next {
                    value |= flags::NEXT;
                }
            }
            Frame::MetadataPush(_) => {
                value |= flags::METADATA;
            }
            Frame::Resume(_) => {}
            Frame::Ext(f) => {
                if f.payload.metadata.is_some() {
                    value |= flags::METADATA;
                }
                if f.can_ignore {
                    value |= flags::IGNORE;
                }
            }
        }
        value
    }
}
