//! Application seam: the request responder.
//!
//! A [`Responder`] receives remote-initiated interactions from the
//! connection state machine, always on the connection's executor. Handlers
//! answer through the provided [`StreamSink`]; long-running work should be
//! spawned, taking the sink along.
//!
//! Every method has a default implementation, so a responder only
//! implements the interaction types it serves; the defaults reject
//! stream-carrying requests and drop the rest.

use bytes::Bytes;

use crate::frame::Payload;
use crate::stream::{StreamEvent, StreamSink};

/// Handler for remote-initiated interactions.
pub trait Responder: Send + Sync {
    /// A fire-and-forget request arrived.
    fn handle_fire_and_forget(&self, payload: Payload) {
        tracing::debug!(bytes = payload.len(), "fire-and-forget dropped");
    }

    /// A metadata push arrived.
    fn handle_metadata_push(&self, metadata: Bytes) {
        tracing::debug!(bytes = metadata.len(), "metadata push dropped");
    }

    /// A request/response arrived; answer with one `sink.payload(..)` or
    /// fail with `sink.error(..)`.
    fn handle_request_response(&self, payload: Payload, sink: StreamSink) {
        let _ = payload;
        sink.error("request/response not supported");
    }

    /// A request/stream arrived; emit elements with `sink.payload(..)` and
    /// finish with `sink.complete()`.
    fn handle_request_stream(&self, payload: Payload, sink: StreamSink) {
        let _ = payload;
        sink.error("request/stream not supported");
    }

    /// A request/channel arrived; `inbound` observes the requester's
    /// elements, the sink drives the responder's direction.
    fn handle_request_channel(
        &self,
        payload: Payload,
        inbound: tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
        sink: StreamSink,
    ) {
        let _ = (payload, inbound);
        sink.error("request/channel not supported");
    }
}

/// Responder that rejects every stream-carrying request.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingResponder;

impl Responder for RejectingResponder {}
