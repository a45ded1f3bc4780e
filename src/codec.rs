//! Payload codecs keyed by the SETUP mime types.
//!
//! The wire protocol treats payload data as opaque bytes; these helpers
//! cover the two structured mime types applications commonly negotiate.
//! MsgPack uses `to_vec_named` so structs travel as maps, which is what
//! non-Rust peers expect.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Mime type for [`MsgPackCodec`] payloads.
pub const MIME_MSGPACK: &str = "application/x-msgpack";

/// Mime type for [`JsonCodec`] payloads.
pub const MIME_JSON: &str = "application/json";

/// MessagePack codec for structured payload data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map format).
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// JSON codec for structured payload data.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
