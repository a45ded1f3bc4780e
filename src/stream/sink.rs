//! Writer capability handed to responders and channel requesters.
//!
//! A [`StreamSink`] does not touch the connection directly: it posts
//! `(stream id, event)` pairs onto the executor's sink channel, and the
//! driver resolves them against the stream map. Events for a stream that
//! has already terminated are dropped silently.

use tokio::sync::mpsc;

use crate::frame::{Payload, StreamId};

/// Outbound intent of an application on one stream.
#[derive(Debug)]
pub enum SinkEvent {
    /// Emit an element.
    Payload(Payload),
    /// Complete the outbound direction.
    Complete,
    /// Fail the stream with an application error.
    Error(String),
}

/// Sending half of the executor's sink channel.
pub type SinkEventSender = mpsc::UnboundedSender<(StreamId, SinkEvent)>;

/// Receiving half of the executor's sink channel.
pub type SinkEventReceiver = mpsc::UnboundedReceiver<(StreamId, SinkEvent)>;

/// Create the sink channel a state machine and its driver share.
pub fn sink_channel() -> (SinkEventSender, SinkEventReceiver) {
    mpsc::unbounded_channel()
}

/// Per-stream writer capability.
///
/// Cheap to clone and safe to move into spawned tasks; every method is
/// non-blocking.
#[derive(Debug, Clone)]
pub struct StreamSink {
    stream_id: StreamId,
    tx: SinkEventSender,
}

impl StreamSink {
    /// Create a sink bound to a stream.
    pub fn new(stream_id: StreamId, tx: SinkEventSender) -> Self {
        Self { stream_id, tx }
    }

    /// Stream this sink writes to.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Emit an element.
    ///
    /// For a request/response stream one element both answers and completes
    /// the request.
    pub fn payload(&self, payload: Payload) {
        self.post(SinkEvent::Payload(payload));
    }

    /// Complete the outbound direction.
    pub fn complete(&self) {
        self.post(SinkEvent::Complete);
    }

    /// Fail the stream with an application error.
    pub fn error(&self, message: impl Into<String>) {
        self.post(SinkEvent::Error(message.into()));
    }

    fn post(&self, event: SinkEvent) {
        if self.tx.send((self.stream_id, event)).is_err() {
            tracing::trace!(
                stream_id = self.stream_id,
                "sink event dropped, connection gone"
            );
        }
    }
}
