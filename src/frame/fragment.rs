//! Reassembly of fragmented initial request frames.
//!
//! A remote-initiated request carrying the FOLLOWS flag arrives as an
//! initial REQUEST frame followed by PAYLOAD frames on the same stream,
//! each flagged FOLLOWS until the last. The accumulator buffers metadata
//! and data separately and, once FOLLOWS clears, synthesizes the logical
//! request frame the unfragmented path would have produced.

use bytes::BytesMut;

use crate::error::{RSocketError, Result};

use super::frame::{
    Frame, Payload, PayloadFrame, RequestChannelFrame, RequestFnfFrame, RequestResponseFrame,
    RequestStreamFrame,
};
use super::header::{FrameType, StreamId};

/// Default bound on a reassembled request (metadata plus data).
pub const DEFAULT_MAX_FRAGMENTED_SIZE: usize = 16 * 1024 * 1024;

/// Per-stream buffer assembling a fragmented initial request.
#[derive(Debug)]
pub struct FragmentAccumulator {
    stream_id: StreamId,
    kind: FrameType,
    initial_request_n: u32,
    complete: bool,
    metadata: Option<BytesMut>,
    data: BytesMut,
    max_size: usize,
}

impl FragmentAccumulator {
    /// Start accumulation from the initial request frame.
    ///
    /// Fails unless the frame is a new-stream request with FOLLOWS set, or
    /// when the first fragment already exceeds the bound.
    pub fn new(frame: Frame, max_size: usize) -> Result<Self> {
        let (stream_id, kind, initial_request_n, complete, payload) = match frame {
            Frame::RequestResponse(f) if f.follows => {
                (f.stream_id, FrameType::RequestResponse, 0, false, f.payload)
            }
            Frame::RequestFnf(f) if f.follows => {
                (f.stream_id, FrameType::RequestFnf, 0, false, f.payload)
            }
            Frame::RequestStream(f) if f.follows => (
                f.stream_id,
                FrameType::RequestStream,
                f.initial_request_n,
                false,
                f.payload,
            ),
            Frame::RequestChannel(f) if f.follows => (
                f.stream_id,
                FrameType::RequestChannel,
                f.initial_request_n,
                f.complete,
                f.payload,
            ),
            other => {
                return Err(RSocketError::Protocol(format!(
                    "{} frame cannot start fragment accumulation",
                    other.frame_type()
                )))
            }
        };

        let accumulator = Self {
            stream_id,
            kind,
            initial_request_n,
            complete,
            metadata: payload.metadata.map(|m| BytesMut::from(&m[..])),
            data: BytesMut::from(&payload.data[..]),
            max_size,
        };
        accumulator.check_size()?;
        Ok(accumulator)
    }

    /// Stream the fragments belong to.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Bytes buffered so far.
    pub fn len(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.len()) + self.data.len()
    }

    /// Whether nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a continuation PAYLOAD fragment.
    ///
    /// Fails when the bound is exceeded; the caller turns that into a
    /// stream-level REJECTED error.
    pub fn append(&mut self, fragment: &PayloadFrame) -> Result<()> {
        if let Some(metadata) = &fragment.payload.metadata {
            self.metadata
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(metadata);
        }
        self.data.extend_from_slice(&fragment.payload.data);
        if fragment.complete {
            self.complete = true;
        }
        self.check_size()
    }

    /// Synthesize the complete logical request frame, FOLLOWS cleared.
    pub fn finalize(self) -> Frame {
        let payload = Payload {
            metadata: self.metadata.map(BytesMut::freeze),
            data: self.data.freeze(),
        };
        match self.kind {
            FrameType::RequestResponse => Frame::RequestResponse(RequestResponseFrame {
                stream_id: self.stream_id,
                follows: false,
                payload,
            }),
            FrameType::RequestFnf => Frame::RequestFnf(RequestFnfFrame {
                stream_id: self.stream_id,
                follows: false,
                payload,
            }),
            FrameType::RequestStream => Frame::RequestStream(RequestStreamFrame {
                stream_id: self.stream_id,
                follows: false,
                initial_request_n: self.initial_request_n,
                payload,
            }),
            // `new` admits exactly the four request kinds
            _ => Frame::RequestChannel(RequestChannelFrame {
                stream_id: self.stream_id,
                follows: false,
                complete: self.complete,
                initial_request_n: self.initial_request_n,
                payload,
            }),
        }
    }

    fn check_size(&self) -> Result<()> {
        if self.len() > self.max_size {
            return Err(RSocketError::Protocol(format!(
                "fragmented request of {} bytes exceeds the {}-byte bound",
                self.len(),
                self.max_size
            )));
        }
        Ok(())
    }
}
