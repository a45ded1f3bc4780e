//! Frame model and wire codec.
//!
//! - [`header`]: the 6-byte frame header, types and flags
//! - [`frame`]: typed frame variants and payloads
//! - [`serializer`]: bit-exact versioned encode/decode
//! - [`fragment`]: reassembly of fragmented initial requests

pub mod fragment;
#[allow(clippy::module_inception)]
pub mod frame;
pub mod header;
pub mod serializer;

pub use fragment::{FragmentAccumulator, DEFAULT_MAX_FRAGMENTED_SIZE};
pub use frame::{
    CancelFrame, ErrorFrame, ExtFrame, Frame, KeepaliveFrame, LeaseFrame, MetadataPushFrame,
    Payload, PayloadFrame, RequestChannelFrame, RequestFnfFrame, RequestNFrame,
    RequestResponseFrame, RequestStreamFrame, ResumeFrame, ResumeOkFrame, SetupFrame,
};
pub use header::{
    flags, FrameHeader, FrameType, StreamId, CONNECTION_STREAM_ID, HEADER_SIZE, MAX_STREAM_ID,
};
pub use serializer::{FrameSerializer, MAX_METADATA_LENGTH, MAX_U31};
