//! Error types for rsocket-core.

use thiserror::Error;

/// Wire-level error codes carried by ERROR frames.
///
/// Codes below `0x200` are connection-level and terminate the whole
/// connection; codes from `0x201` are stream-level and terminate only the
/// stream they are sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The SETUP frame is invalid for the server.
    InvalidSetup,
    /// The server does not support the setup as specified.
    UnsupportedSetup,
    /// The server rejected the setup; the client should not retry.
    RejectedSetup,
    /// The server rejected the resume; the client should not retry.
    RejectedResume,
    /// The connection is being terminated because of an internal error.
    ConnectionError,
    /// The connection is being terminated gracefully.
    ConnectionClose,
    /// Application-layer error from the responder (stream-level).
    ApplicationError,
    /// The responder rejected the request (stream-level).
    Rejected,
    /// The request was canceled (stream-level).
    Canceled,
    /// The request is invalid (stream-level).
    Invalid,
    /// A code this implementation does not know.
    Other(u32),
}

impl ErrorCode {
    /// Wire value, as defined by the RSocket protocol.
    pub fn to_u32(self) -> u32 {
        match self {
            ErrorCode::InvalidSetup => 0x001,
            ErrorCode::UnsupportedSetup => 0x002,
            ErrorCode::RejectedSetup => 0x003,
            ErrorCode::RejectedResume => 0x004,
            ErrorCode::ConnectionError => 0x101,
            ErrorCode::ConnectionClose => 0x102,
            ErrorCode::ApplicationError => 0x201,
            ErrorCode::Rejected => 0x202,
            ErrorCode::Canceled => 0x203,
            ErrorCode::Invalid => 0x204,
            ErrorCode::Other(code) => code,
        }
    }

    /// Decode a wire value. Unknown codes are preserved as [`ErrorCode::Other`].
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x001 => ErrorCode::InvalidSetup,
            0x002 => ErrorCode::UnsupportedSetup,
            0x003 => ErrorCode::RejectedSetup,
            0x004 => ErrorCode::RejectedResume,
            0x101 => ErrorCode::ConnectionError,
            0x102 => ErrorCode::ConnectionClose,
            0x201 => ErrorCode::ApplicationError,
            0x202 => ErrorCode::Rejected,
            0x203 => ErrorCode::Canceled,
            0x204 => ErrorCode::Invalid,
            other => ErrorCode::Other(other),
        }
    }

    /// Whether this code terminates the whole connection when received on
    /// stream 0.
    pub fn is_connection_level(self) -> bool {
        self.to_u32() < 0x200
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InvalidSetup => write!(f, "INVALID_SETUP"),
            ErrorCode::UnsupportedSetup => write!(f, "UNSUPPORTED_SETUP"),
            ErrorCode::RejectedSetup => write!(f, "REJECTED_SETUP"),
            ErrorCode::RejectedResume => write!(f, "REJECTED_RESUME"),
            ErrorCode::ConnectionError => write!(f, "CONNECTION_ERROR"),
            ErrorCode::ConnectionClose => write!(f, "CONNECTION_CLOSE"),
            ErrorCode::ApplicationError => write!(f, "APPLICATION_ERROR"),
            ErrorCode::Rejected => write!(f, "REJECTED"),
            ErrorCode::Canceled => write!(f, "CANCELED"),
            ErrorCode::Invalid => write!(f, "INVALID"),
            ErrorCode::Other(code) => write!(f, "UNKNOWN({:#x})", code),
        }
    }
}

/// Main error type for all rsocket-core operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame buffer could not be decoded.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The peer violated the protocol (bad stream id parity, SETUP on an
    /// established connection, unknown mandatory frame).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer requested a protocol version this build does not speak.
    #[error("unsupported setup: {0}")]
    UnsupportedSetup(String),

    /// Resumption was requested from a position that is no longer retained.
    #[error("rejected resume: {0}")]
    RejectedResume(String),

    /// Stream id 0 was passed where a non-zero stream id is required.
    #[error("stream id 0 is reserved for connection-level frames")]
    ReservedStreamId,

    /// The 31-bit stream id space is exhausted.
    #[error("stream id space exhausted")]
    StreamIdExhausted,

    /// The lease budget granted by the peer has run out.
    #[error("no lease permits available")]
    LeaseExhausted,

    /// An ERROR frame was received for a stream.
    #[error("stream error {code}: {message}")]
    Stream {
        /// Wire error code.
        code: ErrorCode,
        /// UTF-8 error data from the frame.
        message: String,
    },

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// JSON payload codec error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack payload encode error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack payload decode error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// Result type alias using RSocketError.
pub type Result<T> = std::result::Result<T, RSocketError>;
