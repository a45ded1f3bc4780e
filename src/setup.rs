//! Handshake parameters: protocol version, resume token, SETUP and RESUME
//! negotiation values.
//!
//! [`SetupParameters`] is what a client supplies to open a connection and
//! what a server extracts from a received SETUP frame. [`ResumeParameters`]
//! is the server-side view of a received RESUME frame.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{RSocketError, Result};
use crate::frame::{ResumeFrame, SetupFrame};
use crate::frame::frame::Payload;

/// Default keepalive interval sent in SETUP.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(30_000);

/// Default max lifetime sent in SETUP.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_millis(90_000);

/// Default mime type for both metadata and data when none is configured.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Maximum resume token length (length travels as a u16).
pub const MAX_RESUME_TOKEN_LENGTH: usize = 65_535;

/// Protocol version as carried in SETUP and RESUME frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    /// Major version number.
    pub major: u16,
    /// Minor version number.
    pub minor: u16,
}

impl ProtocolVersion {
    /// RSocket 1.0, the only version this build speaks.
    pub const V1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    /// Whether this build can serialize frames for the version.
    pub fn is_supported(self) -> bool {
        self == Self::V1_0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Opaque token identifying a logical session across reconnects.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    /// Wrap raw token bytes. Fails when the token exceeds
    /// [`MAX_RESUME_TOKEN_LENGTH`].
    pub fn new(bytes: Bytes) -> Result<Self> {
        if bytes.len() > MAX_RESUME_TOKEN_LENGTH {
            return Err(RSocketError::Protocol(format!(
                "resume token of {} bytes exceeds the {}-byte limit",
                bytes.len(),
                MAX_RESUME_TOKEN_LENGTH
            )));
        }
        Ok(Self(bytes))
    }

    /// Generate a fresh 16-byte token from system time and process id.
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let pid = std::process::id() as u64;
        let mixed = nanos.wrapping_mul(0x517cc1b727220a95) ^ pid;

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&mixed.to_be_bytes());
        bytes[8..].copy_from_slice(&nanos.rotate_left(17).to_be_bytes());
        Self(Bytes::copy_from_slice(&bytes))
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Token length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the token is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResumeToken(")?;
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Parameters for the SETUP handshake.
#[derive(Debug, Clone)]
pub struct SetupParameters {
    /// Protocol version to negotiate.
    pub version: ProtocolVersion,
    /// Interval between KEEPALIVE frames from the client.
    pub keepalive_interval: Duration,
    /// Time without inbound activity after which the connection is dead.
    pub max_lifetime: Duration,
    /// Resume token; `Some` makes the session resumable.
    pub token: Option<ResumeToken>,
    /// Whether the client honors LEASE frames from the responder.
    pub honors_lease: bool,
    /// Mime type of payload metadata.
    pub metadata_mime_type: String,
    /// Mime type of payload data.
    pub data_mime_type: String,
    /// Setup payload handed to the server responder.
    pub payload: Payload,
}

impl Default for SetupParameters {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V1_0,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            token: None,
            honors_lease: false,
            metadata_mime_type: DEFAULT_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_MIME_TYPE.to_string(),
            payload: Payload::default(),
        }
    }
}

impl SetupParameters {
    /// Whether the session should be resumable.
    pub fn is_resumable(&self) -> bool {
        self.token.is_some()
    }

    /// Extract parameters from a received SETUP frame.
    pub fn from_frame(frame: SetupFrame) -> Self {
        Self {
            version: frame.version,
            keepalive_interval: Duration::from_millis(u64::from(frame.keepalive_interval_ms)),
            max_lifetime: Duration::from_millis(u64::from(frame.max_lifetime_ms)),
            token: frame.token,
            honors_lease: frame.lease,
            metadata_mime_type: frame.metadata_mime_type,
            data_mime_type: frame.data_mime_type,
            payload: frame.payload,
        }
    }

    /// Build the SETUP frame encoding these parameters.
    pub fn to_frame(&self) -> SetupFrame {
        SetupFrame {
            version: self.version,
            keepalive_interval_ms: clamp_millis(self.keepalive_interval),
            max_lifetime_ms: clamp_millis(self.max_lifetime),
            token: self.token.clone(),
            lease: self.honors_lease,
            metadata_mime_type: self.metadata_mime_type.clone(),
            data_mime_type: self.data_mime_type.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Server-side view of a received RESUME frame.
#[derive(Debug, Clone)]
pub struct ResumeParameters {
    /// Protocol version the client resumed with.
    pub version: ProtocolVersion,
    /// Session token.
    pub token: ResumeToken,
    /// Last server position the client received.
    pub last_received_server_position: u64,
    /// Earliest position the client can still replay from.
    pub first_client_position: u64,
}

impl ResumeParameters {
    /// Extract parameters from a received RESUME frame.
    pub fn from_frame(frame: ResumeFrame) -> Self {
        Self {
            version: frame.version,
            token: frame.token,
            last_received_server_position: frame.last_received_server_position,
            first_client_position: frame.first_client_position,
        }
    }
}

fn clamp_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis())
        .unwrap_or(u32::MAX)
        .min(0x7FFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_support() {
        assert!(ProtocolVersion::V1_0.is_supported());
        assert!(!ProtocolVersion { major: 0, minor: 1 }.is_supported());
        assert_eq!(ProtocolVersion::V1_0.to_string(), "1.0");
    }

    #[test]
    fn test_token_length_limit() {
        let ok = ResumeToken::new(Bytes::from(vec![0u8; MAX_RESUME_TOKEN_LENGTH]));
        assert!(ok.is_ok());
        let too_long = ResumeToken::new(Bytes::from(vec![0u8; MAX_RESUME_TOKEN_LENGTH + 1]));
        assert!(too_long.is_err());
    }

    #[test]
    fn test_token_generation_unique() {
        let tokens: Vec<ResumeToken> = (0..8).map(|_| ResumeToken::generate()).collect();
        for (i, a) in tokens.iter().enumerate() {
            assert_eq!(a.len(), 16);
            for (j, b) in tokens.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_setup_parameters_frame_roundtrip() {
        let params = SetupParameters {
            token: Some(ResumeToken::generate()),
            honors_lease: true,
            metadata_mime_type: "application/json".to_string(),
            data_mime_type: "application/json".to_string(),
            payload: Payload::from_data(Bytes::from_static(b"hello")),
            ..SetupParameters::default()
        };

        let restored = SetupParameters::from_frame(params.to_frame());
        assert_eq!(restored.version, params.version);
        assert_eq!(restored.keepalive_interval, params.keepalive_interval);
        assert_eq!(restored.max_lifetime, params.max_lifetime);
        assert_eq!(restored.token, params.token);
        assert!(restored.honors_lease);
        assert_eq!(restored.data_mime_type, "application/json");
        assert_eq!(restored.payload, params.payload);
    }

    #[test]
    fn test_clamp_millis_bounds() {
        assert_eq!(clamp_millis(Duration::from_millis(1)), 1);
        assert_eq!(clamp_millis(Duration::from_secs(u64::MAX / 2)), 0x7FFF_FFFF);
    }
}
