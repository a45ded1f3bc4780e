//! Per-stream state machines.
//!
//! One machine exists per live stream entry in the connection's demux
//! table. The common contract is small: frames routed by the multiplexer
//! come in through [`StreamStateMachine::on_frame`], application intents
//! through [`StreamStateMachine::on_sink_event`], and both return a
//! [`StreamOutput`] of frames to write plus an optional terminal signal.
//! The connection applies the output; on a terminal signal it removes the
//! entry and calls [`StreamStateMachine::close`], which is idempotent.
//!
//! The six variants cover requester and responder halves of the three
//! stream-carrying interaction types; fire-and-forget needs no machine.

use tokio::sync::{mpsc, oneshot};

use crate::error::{ErrorCode, RSocketError};
use crate::frame::{ErrorFrame, Frame, Payload, PayloadFrame, StreamId};

use super::sink::SinkEvent;

/// Terminal signal a stream ends with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    /// Normal completion.
    Complete,
    /// Application error, local or remote.
    ApplicationError,
    /// Canceled by the peer or locally.
    Cancel,
    /// The connection terminated underneath the stream.
    ConnectionError,
    /// Stream-level protocol error.
    StreamError,
    /// Invalid frame or state for this stream.
    Invalid,
}

impl StreamSignal {
    fn from_error_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ApplicationError => StreamSignal::ApplicationError,
            ErrorCode::Canceled => StreamSignal::Cancel,
            ErrorCode::Invalid => StreamSignal::Invalid,
            _ => StreamSignal::StreamError,
        }
    }
}

/// What a requester observes on its stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// An element arrived.
    Payload(Payload),
    /// The stream completed normally.
    Complete,
    /// The stream failed.
    Error(RSocketError),
}

/// Frames to write and the terminal transition, if any.
#[derive(Debug, Default)]
pub struct StreamOutput {
    /// Frames the connection must write, in order.
    pub frames: Vec<Frame>,
    /// Terminal signal; `Some` removes the stream entry.
    pub terminal: Option<StreamSignal>,
}

impl StreamOutput {
    fn none() -> Self {
        Self::default()
    }

    fn frame(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
            terminal: None,
        }
    }

    fn terminal(signal: StreamSignal) -> Self {
        Self {
            frames: Vec::new(),
            terminal: Some(signal),
        }
    }

    fn frame_and_terminal(frame: Frame, signal: StreamSignal) -> Self {
        Self {
            frames: vec![frame],
            terminal: Some(signal),
        }
    }
}

/// APPLICATION_ERROR frame for a stream; `None` only for stream 0, which
/// machines never carry.
fn app_error_frame(stream_id: StreamId, message: &str) -> Option<Frame> {
    match ErrorFrame::application_error(stream_id, message) {
        Ok(frame) => Some(Frame::Error(frame)),
        Err(err) => {
            tracing::error!(stream_id, %err, "cannot build stream error frame");
            None
        }
    }
}

fn sink_error_output(stream_id: StreamId, message: &str) -> StreamOutput {
    match app_error_frame(stream_id, message) {
        Some(frame) => StreamOutput::frame_and_terminal(frame, StreamSignal::ApplicationError),
        None => StreamOutput::terminal(StreamSignal::ApplicationError),
    }
}

/// Requester half of request/response.
#[derive(Debug)]
pub struct RequestResponseRequester {
    stream_id: StreamId,
    reply: Option<oneshot::Sender<Result<Payload, RSocketError>>>,
}

/// Requester half of request/stream.
#[derive(Debug)]
pub struct StreamRequester {
    stream_id: StreamId,
    events: mpsc::UnboundedSender<StreamEvent>,
    done: bool,
}

/// Requester half of request/channel.
#[derive(Debug)]
pub struct ChannelRequester {
    stream_id: StreamId,
    events: mpsc::UnboundedSender<StreamEvent>,
    allowance: u32,
    outbound_done: bool,
    inbound_done: bool,
    done: bool,
}

/// Responder half of request/response.
#[derive(Debug)]
pub struct RequestResponseResponder {
    stream_id: StreamId,
    done: bool,
}

/// Responder half of request/stream.
#[derive(Debug)]
pub struct StreamResponder {
    stream_id: StreamId,
    allowance: u32,
    done: bool,
}

/// Responder half of request/channel.
#[derive(Debug)]
pub struct ChannelResponder {
    stream_id: StreamId,
    inbound: mpsc::UnboundedSender<StreamEvent>,
    allowance: u32,
    outbound_done: bool,
    inbound_done: bool,
    done: bool,
}

/// Tagged sum over the per-stream behaviors.
#[derive(Debug)]
pub enum StreamStateMachine {
    /// Requester half of request/response.
    RequestResponseRequester(RequestResponseRequester),
    /// Requester half of request/stream.
    StreamRequester(StreamRequester),
    /// Requester half of request/channel.
    ChannelRequester(ChannelRequester),
    /// Responder half of request/response.
    RequestResponseResponder(RequestResponseResponder),
    /// Responder half of request/stream.
    StreamResponder(StreamResponder),
    /// Responder half of request/channel.
    ChannelResponder(ChannelResponder),
}

impl StreamStateMachine {
    /// Requester machine for request/response; the receiver resolves with
    /// the response payload or the stream error.
    pub fn request_response_requester(
        stream_id: StreamId,
    ) -> (Self, oneshot::Receiver<Result<Payload, RSocketError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::RequestResponseRequester(RequestResponseRequester {
                stream_id,
                reply: Some(tx),
            }),
            rx,
        )
    }

    /// Requester machine for request/stream.
    pub fn stream_requester(
        stream_id: StreamId,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::StreamRequester(StreamRequester {
                stream_id,
                events: tx,
                done: false,
            }),
            rx,
        )
    }

    /// Requester machine for request/channel.
    pub fn channel_requester(
        stream_id: StreamId,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::ChannelRequester(ChannelRequester {
                stream_id,
                events: tx,
                allowance: 0,
                outbound_done: false,
                inbound_done: false,
                done: false,
            }),
            rx,
        )
    }

    /// Responder machine for request/response.
    pub fn request_response_responder(stream_id: StreamId) -> Self {
        Self::RequestResponseResponder(RequestResponseResponder {
            stream_id,
            done: false,
        })
    }

    /// Responder machine for request/stream with the initial allowance.
    pub fn stream_responder(stream_id: StreamId, initial_request_n: u32) -> Self {
        Self::StreamResponder(StreamResponder {
            stream_id,
            allowance: initial_request_n,
            done: false,
        })
    }

    /// Responder machine for request/channel; the receiver observes the
    /// requester's inbound elements.
    pub fn channel_responder(
        stream_id: StreamId,
        initial_request_n: u32,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::ChannelResponder(ChannelResponder {
                stream_id,
                inbound: tx,
                allowance: initial_request_n,
                outbound_done: false,
                inbound_done: false,
                done: false,
            }),
            rx,
        )
    }

    /// Stream this machine serves.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::RequestResponseRequester(m) => m.stream_id,
            Self::StreamRequester(m) => m.stream_id,
            Self::ChannelRequester(m) => m.stream_id,
            Self::RequestResponseResponder(m) => m.stream_id,
            Self::StreamResponder(m) => m.stream_id,
            Self::ChannelResponder(m) => m.stream_id,
        }
    }

    /// Process an inbound frame routed by the multiplexer.
    pub fn on_frame(&mut self, frame: Frame) -> StreamOutput {
        match self {
            Self::RequestResponseRequester(m) => m.on_frame(frame),
            Self::StreamRequester(m) => m.on_frame(frame),
            Self::ChannelRequester(m) => m.on_frame(frame),
            Self::RequestResponseResponder(m) => m.on_frame(frame),
            Self::StreamResponder(m) => m.on_frame(frame),
            Self::ChannelResponder(m) => m.on_frame(frame),
        }
    }

    /// Process an application intent posted through a [`super::StreamSink`].
    pub fn on_sink_event(&mut self, event: SinkEvent) -> StreamOutput {
        match self {
            Self::RequestResponseRequester(_) => {
                tracing::debug!("sink event on request/response requester ignored");
                StreamOutput::none()
            }
            Self::StreamRequester(_) => {
                tracing::debug!("sink event on stream requester ignored");
                StreamOutput::none()
            }
            Self::ChannelRequester(m) => m.on_sink_event(event),
            Self::RequestResponseResponder(m) => m.on_sink_event(event),
            Self::StreamResponder(m) => m.on_sink_event(event),
            Self::ChannelResponder(m) => m.on_sink_event(event),
        }
    }

    /// Deliver the terminal signal to the machine's consumers.
    ///
    /// Idempotent: machines that already notified their consumers do
    /// nothing.
    pub fn close(&mut self, signal: StreamSignal) {
        match self {
            Self::RequestResponseRequester(m) => m.close(signal),
            Self::StreamRequester(m) => m.close(signal),
            Self::ChannelRequester(m) => m.close(signal),
            Self::RequestResponseResponder(m) => m.done = true,
            Self::StreamResponder(m) => m.done = true,
            Self::ChannelResponder(m) => m.close(signal),
        }
    }
}

fn signal_event(signal: StreamSignal) -> StreamEvent {
    match signal {
        StreamSignal::Complete => StreamEvent::Complete,
        StreamSignal::Cancel => StreamEvent::Error(RSocketError::Stream {
            code: ErrorCode::Canceled,
            message: "stream canceled".to_string(),
        }),
        StreamSignal::ConnectionError => StreamEvent::Error(RSocketError::ConnectionClosed),
        StreamSignal::ApplicationError => StreamEvent::Error(RSocketError::Stream {
            code: ErrorCode::ApplicationError,
            message: "stream failed".to_string(),
        }),
        StreamSignal::StreamError | StreamSignal::Invalid => {
            StreamEvent::Error(RSocketError::Stream {
                code: ErrorCode::Invalid,
                message: "stream terminated".to_string(),
            })
        }
    }
}

impl RequestResponseRequester {
    fn on_frame(&mut self, frame: Frame) -> StreamOutput {
        match frame {
            Frame::Payload(pf) => {
                if let Some(reply) = self.reply.take() {
                    let payload = if pf.next { pf.payload } else { Payload::default() };
                    let _ = reply.send(Ok(payload));
                }
                StreamOutput::terminal(StreamSignal::Complete)
            }
            Frame::Error(ef) => {
                let signal = StreamSignal::from_error_code(ef.code);
                if let Some(reply) = self.reply.take() {
                    let _ = reply.send(Err(RSocketError::Stream {
                        code: ef.code,
                        message: ef.message(),
                    }));
                }
                StreamOutput::terminal(signal)
            }
            Frame::Cancel(_) => {
                if let Some(reply) = self.reply.take() {
                    let _ = reply.send(Err(RSocketError::Stream {
                        code: ErrorCode::Canceled,
                        message: "canceled by peer".to_string(),
                    }));
                }
                StreamOutput::terminal(StreamSignal::Cancel)
            }
            other => {
                tracing::debug!(
                    stream_id = self.stream_id,
                    frame_type = %other.frame_type(),
                    "unexpected frame for request/response requester"
                );
                StreamOutput::none()
            }
        }
    }

    fn close(&mut self, signal: StreamSignal) {
        if let Some(reply) = self.reply.take() {
            let result = match signal_event(signal) {
                StreamEvent::Error(err) => Err(err),
                _ => Err(RSocketError::ConnectionClosed),
            };
            let _ = reply.send(result);
        }
    }
}

impl StreamRequester {
    fn on_frame(&mut self, frame: Frame) -> StreamOutput {
        match frame {
            Frame::Payload(pf) => {
                if pf.next {
                    let _ = self.events.send(StreamEvent::Payload(pf.payload));
                }
                if pf.complete {
                    self.done = true;
                    let _ = self.events.send(StreamEvent::Complete);
                    StreamOutput::terminal(StreamSignal::Complete)
                } else {
                    StreamOutput::none()
                }
            }
            Frame::Error(ef) => {
                self.done = true;
                let signal = StreamSignal::from_error_code(ef.code);
                let _ = self.events.send(StreamEvent::Error(RSocketError::Stream {
                    code: ef.code,
                    message: ef.message(),
                }));
                StreamOutput::terminal(signal)
            }
            Frame::Cancel(_) => {
                self.done = true;
                let _ = self.events.send(signal_event(StreamSignal::Cancel));
                StreamOutput::terminal(StreamSignal::Cancel)
            }
            other => {
                tracing::debug!(
                    stream_id = self.stream_id,
                    frame_type = %other.frame_type(),
                    "unexpected frame for stream requester"
                );
                StreamOutput::none()
            }
        }
    }

    fn close(&mut self, signal: StreamSignal) {
        if !self.done {
            self.done = true;
            let _ = self.events.send(signal_event(signal));
        }
    }
}

impl ChannelRequester {
    fn on_frame(&mut self, frame: Frame) -> StreamOutput {
        match frame {
            Frame::Payload(pf) => {
                if pf.next {
                    let _ = self.events.send(StreamEvent::Payload(pf.payload));
                }
                if pf.complete {
                    self.inbound_done = true;
                    let _ = self.events.send(StreamEvent::Complete);
                }
                self.maybe_complete()
            }
            Frame::RequestN(rn) => {
                self.allowance = self.allowance.saturating_add(rn.request_n);
                StreamOutput::none()
            }
            Frame::Error(ef) => {
                self.done = true;
                let signal = StreamSignal::from_error_code(ef.code);
                let _ = self.events.send(StreamEvent::Error(RSocketError::Stream {
                    code: ef.code,
                    message: ef.message(),
                }));
                StreamOutput::terminal(signal)
            }
            Frame::Cancel(_) => {
                self.done = true;
                let _ = self.events.send(signal_event(StreamSignal::Cancel));
                StreamOutput::terminal(StreamSignal::Cancel)
            }
            other => {
                tracing::debug!(
                    stream_id = self.stream_id,
                    frame_type = %other.frame_type(),
                    "unexpected frame for channel requester"
                );
                StreamOutput::none()
            }
        }
    }

    fn on_sink_event(&mut self, event: SinkEvent) -> StreamOutput {
        if self.done || self.outbound_done {
            return StreamOutput::none();
        }
        match event {
            SinkEvent::Payload(payload) => {
                self.allowance = self.allowance.saturating_sub(1);
                StreamOutput::frame(Frame::Payload(PayloadFrame::next(self.stream_id, payload)))
            }
            SinkEvent::Complete => {
                self.outbound_done = true;
                let frame = Frame::Payload(PayloadFrame::complete(self.stream_id));
                let mut output = self.maybe_complete();
                output.frames.insert(0, frame);
                output
            }
            SinkEvent::Error(message) => {
                self.done = true;
                sink_error_output(self.stream_id, &message)
            }
        }
    }

    fn maybe_complete(&mut self) -> StreamOutput {
        if self.inbound_done && self.outbound_done && !self.done {
            self.done = true;
            StreamOutput::terminal(StreamSignal::Complete)
        } else {
            StreamOutput::none()
        }
    }

    fn close(&mut self, signal: StreamSignal) {
        if !self.done {
            self.done = true;
            let _ = self.events.send(signal_event(signal));
        }
    }
}

impl RequestResponseResponder {
    fn on_frame(&mut self, frame: Frame) -> StreamOutput {
        match frame {
            Frame::Cancel(_) => {
                self.done = true;
                StreamOutput::terminal(StreamSignal::Cancel)
            }
            Frame::RequestN(_) => StreamOutput::none(),
            other => {
                tracing::debug!(
                    stream_id = self.stream_id,
                    frame_type = %other.frame_type(),
                    "unexpected frame for request/response responder"
                );
                StreamOutput::none()
            }
        }
    }

    fn on_sink_event(&mut self, event: SinkEvent) -> StreamOutput {
        if self.done {
            return StreamOutput::none();
        }
        self.done = true;
        match event {
            SinkEvent::Payload(payload) => StreamOutput::frame_and_terminal(
                Frame::Payload(PayloadFrame::next_complete(self.stream_id, payload)),
                StreamSignal::Complete,
            ),
            SinkEvent::Complete => StreamOutput::frame_and_terminal(
                Frame::Payload(PayloadFrame::complete(self.stream_id)),
                StreamSignal::Complete,
            ),
            SinkEvent::Error(message) => sink_error_output(self.stream_id, &message),
        }
    }
}

impl StreamResponder {
    fn on_frame(&mut self, frame: Frame) -> StreamOutput {
        match frame {
            Frame::Cancel(_) => {
                self.done = true;
                StreamOutput::terminal(StreamSignal::Cancel)
            }
            Frame::RequestN(rn) => {
                self.allowance = self.allowance.saturating_add(rn.request_n);
                StreamOutput::none()
            }
            other => {
                tracing::debug!(
                    stream_id = self.stream_id,
                    frame_type = %other.frame_type(),
                    "unexpected frame for stream responder"
                );
                StreamOutput::none()
            }
        }
    }

    fn on_sink_event(&mut self, event: SinkEvent) -> StreamOutput {
        if self.done {
            return StreamOutput::none();
        }
        match event {
            SinkEvent::Payload(payload) => {
                self.allowance = self.allowance.saturating_sub(1);
                StreamOutput::frame(Frame::Payload(PayloadFrame::next(self.stream_id, payload)))
            }
            SinkEvent::Complete => {
                self.done = true;
                StreamOutput::frame_and_terminal(
                    Frame::Payload(PayloadFrame::complete(self.stream_id)),
                    StreamSignal::Complete,
                )
            }
            SinkEvent::Error(message) => {
                self.done = true;
                sink_error_output(self.stream_id, &message)
            }
        }
    }
}

impl ChannelResponder {
    fn on_frame(&mut self, frame: Frame) -> StreamOutput {
        match frame {
            Frame::Payload(pf) => {
                if pf.next {
                    let _ = self.inbound.send(StreamEvent::Payload(pf.payload));
                }
                if pf.complete {
                    self.inbound_done = true;
                    let _ = self.inbound.send(StreamEvent::Complete);
                }
                self.maybe_complete()
            }
            Frame::RequestN(rn) => {
                self.allowance = self.allowance.saturating_add(rn.request_n);
                StreamOutput::none()
            }
            Frame::Cancel(_) => {
                self.done = true;
                let _ = self.inbound.send(signal_event(StreamSignal::Cancel));
                StreamOutput::terminal(StreamSignal::Cancel)
            }
            Frame::Error(ef) => {
                self.done = true;
                let signal = StreamSignal::from_error_code(ef.code);
                let _ = self.inbound.send(StreamEvent::Error(RSocketError::Stream {
                    code: ef.code,
                    message: ef.message(),
                }));
                StreamOutput::terminal(signal)
            }
            other => {
                tracing::debug!(
                    stream_id = self.stream_id,
                    frame_type = %other.frame_type(),
                    "unexpected frame for channel responder"
                );
                StreamOutput::none()
            }
        }
    }

    fn on_sink_event(&mut self, event: SinkEvent) -> StreamOutput {
        if self.done || self.outbound_done {
            return StreamOutput::none();
        }
        match event {
            SinkEvent::Payload(payload) => {
                self.allowance = self.allowance.saturating_sub(1);
                StreamOutput::frame(Frame::Payload(PayloadFrame::next(self.stream_id, payload)))
            }
            SinkEvent::Complete => {
                self.outbound_done = true;
                let frame = Frame::Payload(PayloadFrame::complete(self.stream_id));
                let mut output = self.maybe_complete();
                output.frames.insert(0, frame);
                output
            }
            SinkEvent::Error(message) => {
                self.done = true;
                sink_error_output(self.stream_id, &message)
            }
        }
    }

    fn maybe_complete(&mut self) -> StreamOutput {
        if self.inbound_done && self.outbound_done && !self.done {
            self.done = true;
            StreamOutput::terminal(StreamSignal::Complete)
        } else {
            StreamOutput::none()
        }
    }

    fn close(&mut self, signal: StreamSignal) {
        if !self.done {
            self.done = true;
            let _ = self.inbound.send(signal_event(signal));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CancelFrame;

    #[test]
    fn test_request_response_requester_receives_payload() {
        let (mut machine, mut rx) = StreamStateMachine::request_response_requester(3);

        let output = machine.on_frame(Frame::Payload(PayloadFrame::next_complete(
            3,
            Payload::from_static("answer"),
        )));
        assert_eq!(output.terminal, Some(StreamSignal::Complete));
        assert!(output.frames.is_empty());

        let payload = rx.try_recv().unwrap().unwrap();
        assert_eq!(&payload.data[..], b"answer");
    }

    #[test]
    fn test_request_response_requester_receives_error() {
        let (mut machine, mut rx) = StreamStateMachine::request_response_requester(3);

        let output = machine.on_frame(Frame::Error(
            ErrorFrame::application_error(3, "bad input").unwrap(),
        ));
        assert_eq!(output.terminal, Some(StreamSignal::ApplicationError));

        match rx.try_recv().unwrap() {
            Err(RSocketError::Stream { code, message }) => {
                assert_eq!(code, ErrorCode::ApplicationError);
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_request_response_requester_close_fails_pending_reply() {
        let (mut machine, mut rx) = StreamStateMachine::request_response_requester(3);
        machine.close(StreamSignal::ConnectionError);
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_stream_requester_elements_then_complete() {
        let (mut machine, mut rx) = StreamStateMachine::stream_requester(5);

        let output =
            machine.on_frame(Frame::Payload(PayloadFrame::next(5, Payload::from_static("a"))));
        assert!(output.terminal.is_none());

        let output = machine.on_frame(Frame::Payload(PayloadFrame::complete(5)));
        assert_eq!(output.terminal, Some(StreamSignal::Complete));

        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Payload(_)));
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Complete));
    }

    #[test]
    fn test_stream_requester_close_after_complete_is_silent() {
        let (mut machine, mut rx) = StreamStateMachine::stream_requester(5);
        machine.on_frame(Frame::Payload(PayloadFrame::complete(5)));
        machine.close(StreamSignal::Complete);

        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Complete));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_responder_answers_and_terminates() {
        let mut machine = StreamStateMachine::request_response_responder(4);

        let output = machine.on_sink_event(SinkEvent::Payload(Payload::from_static("pong")));
        assert_eq!(output.terminal, Some(StreamSignal::Complete));
        assert_eq!(output.frames.len(), 1);
        match &output.frames[0] {
            Frame::Payload(pf) => {
                assert!(pf.next && pf.complete);
                assert_eq!(&pf.payload.data[..], b"pong");
            }
            other => panic!("unexpected frame {:?}", other),
        }

        // a second response attempt is swallowed
        let output = machine.on_sink_event(SinkEvent::Payload(Payload::from_static("again")));
        assert!(output.frames.is_empty() && output.terminal.is_none());
    }

    #[test]
    fn test_responder_error_emits_application_error() {
        let mut machine = StreamStateMachine::request_response_responder(4);
        let output = machine.on_sink_event(SinkEvent::Error("nope".to_string()));
        assert_eq!(output.terminal, Some(StreamSignal::ApplicationError));
        match &output.frames[0] {
            Frame::Error(ef) => {
                assert_eq!(ef.code, ErrorCode::ApplicationError);
                assert_eq!(ef.message(), "nope");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_stream_responder_allowance_tracking() {
        let mut machine = StreamStateMachine::stream_responder(6, 2);

        machine.on_sink_event(SinkEvent::Payload(Payload::from_static("1")));
        machine.on_sink_event(SinkEvent::Payload(Payload::from_static("2")));
        machine.on_frame(Frame::RequestN(crate::frame::RequestNFrame {
            stream_id: 6,
            request_n: 8,
        }));

        match &machine {
            StreamStateMachine::StreamResponder(m) => assert_eq!(m.allowance, 8),
            other => panic!("unexpected machine {:?}", other),
        }

        let output = machine.on_sink_event(SinkEvent::Complete);
        assert_eq!(output.terminal, Some(StreamSignal::Complete));
    }

    #[test]
    fn test_stream_responder_cancel() {
        let mut machine = StreamStateMachine::stream_responder(6, 1);
        let output = machine.on_frame(Frame::Cancel(CancelFrame { stream_id: 6 }));
        assert_eq!(output.terminal, Some(StreamSignal::Cancel));

        // sink events after cancel produce nothing
        let output = machine.on_sink_event(SinkEvent::Payload(Payload::from_static("late")));
        assert!(output.frames.is_empty());
    }

    #[test]
    fn test_channel_completes_when_both_directions_done() {
        let (mut machine, mut rx) = StreamStateMachine::channel_responder(8, 4);

        // peer completes its direction
        let output = machine.on_frame(Frame::Payload(PayloadFrame::complete(8)));
        assert!(output.terminal.is_none());
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Complete));

        // local completion finishes the channel
        let output = machine.on_sink_event(SinkEvent::Complete);
        assert_eq!(output.terminal, Some(StreamSignal::Complete));
        assert!(matches!(&output.frames[0], Frame::Payload(pf) if pf.complete));
    }

    #[test]
    fn test_channel_requester_request_n_and_payloads() {
        let (mut machine, _rx) = StreamStateMachine::channel_requester(9);

        machine.on_frame(Frame::RequestN(crate::frame::RequestNFrame {
            stream_id: 9,
            request_n: 2,
        }));
        let output = machine.on_sink_event(SinkEvent::Payload(Payload::from_static("out")));
        assert_eq!(output.frames.len(), 1);

        match &machine {
            StreamStateMachine::ChannelRequester(m) => assert_eq!(m.allowance, 1),
            other => panic!("unexpected machine {:?}", other),
        }
    }
}
