//! Connection state machine and stream multiplexer.
//!
//! [`RSocketStateMachine`] owns one transport, the demux table of live
//! streams, the fragment accumulators for partially-arrived initial
//! requests, the resume cache, and the keepalive bookkeeping. It is a
//! synchronous `&mut self` core: the driver (or a test) feeds it complete
//! frame buffers, sink events and keepalive ticks from one logical
//! executor, and it writes frames through the bound [`FrameTransport`].
//!
//! Inbound routing, in order: protocol-version auto-detection on the first
//! frame, header decode, stream 0 to the connection-frame handler, known
//! stream ids to their state machines, fragment accumulators next, then
//! new-stream creation; frames for already-terminated streams are
//! discarded, everything else is a protocol violation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{RSocketError, Result};
use crate::frame::{
    ErrorFrame, FragmentAccumulator, Frame, FrameSerializer, FrameType, KeepaliveFrame, Payload,
    PayloadFrame, RequestChannelFrame, RequestFnfFrame, RequestResponseFrame, RequestStreamFrame,
    RequestNFrame, CancelFrame, MetadataPushFrame, ResumeFrame, ResumeOkFrame, StreamId,
    CONNECTION_STREAM_ID, DEFAULT_MAX_FRAGMENTED_SIZE, MAX_U31,
};
use crate::keepalive::KeepaliveTimer;
use crate::responder::Responder;
use crate::resume::{InMemoryResumeManager, ResumeManager};
use crate::setup::{ProtocolVersion, ResumeParameters, ResumeToken, SetupParameters};
use crate::stream::{
    Role, SinkEvent, SinkEventSender, StreamEvent, StreamOutput, StreamSignal, StreamSink,
    StreamStateMachine, StreamsFactory,
};
use crate::transport::FrameTransport;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport bound; streams and caches retained when resumable.
    Disconnected,
    /// Transport bound, handshake in flight.
    Connecting,
    /// Handshake (or resumption) acknowledged; frames flow.
    Connected,
    /// Transport bound, waiting for the peer to acknowledge the resume
    /// position.
    Resuming,
    /// Terminal; no further transitions.
    Closed,
}

/// Lifecycle notifications, all invoked on the connection's executor.
pub trait ConnectionEvents: Send + Sync {
    /// The connection reached `Connected`.
    fn on_connected(&self) {}
    /// The connection detached its transport but remains resumable.
    fn on_disconnected(&self) {}
    /// The connection closed for good.
    fn on_closed(&self) {}
    /// A stream entry was removed from the demux table.
    fn on_stream_closed(&self, _stream_id: StreamId) {}
}

/// Top-level controller: handshake, frame dispatch, demux table, keepalive
/// bookkeeping, resumption, reconnect across transports.
pub struct RSocketStateMachine {
    role: Role,
    state: ConnectionState,
    is_resumable: bool,
    streams: HashMap<StreamId, StreamStateMachine>,
    stream_fragments: HashMap<StreamId, FragmentAccumulator>,
    streams_factory: StreamsFactory,
    serializer: Option<FrameSerializer>,
    transport: Option<Arc<dyn FrameTransport>>,
    resume_manager: Box<dyn ResumeManager>,
    responder: Arc<dyn Responder>,
    keepalive: Option<KeepaliveTimer>,
    pending_frames: VecDeque<Frame>,
    resume_callback: Option<oneshot::Sender<Result<()>>>,
    sink_tx: SinkEventSender,
    events: Option<Arc<dyn ConnectionEvents>>,
    lease_permits: Option<u32>,
    honors_lease: bool,
    max_fragment_size: usize,
}

impl RSocketStateMachine {
    /// Create a state machine in `Disconnected` state.
    ///
    /// `sink_tx` is the executor's sink channel: responder sinks and
    /// channel writers post `(stream id, event)` pairs onto it, and the
    /// driver feeds them back through [`Self::on_sink_event`].
    pub fn new(role: Role, responder: Arc<dyn Responder>, sink_tx: SinkEventSender) -> Self {
        Self {
            role,
            state: ConnectionState::Disconnected,
            is_resumable: false,
            streams: HashMap::new(),
            stream_fragments: HashMap::new(),
            streams_factory: StreamsFactory::new(role),
            serializer: None,
            transport: None,
            resume_manager: Box::new(InMemoryResumeManager::new()),
            responder,
            keepalive: None,
            pending_frames: VecDeque::new(),
            resume_callback: None,
            sink_tx,
            events: None,
            lease_permits: None,
            honors_lease: false,
            max_fragment_size: DEFAULT_MAX_FRAGMENTED_SIZE,
        }
    }

    /// Replace the resume cache implementation.
    pub fn with_resume_manager(mut self, resume_manager: Box<dyn ResumeManager>) -> Self {
        self.resume_manager = resume_manager;
        self
    }

    /// Register lifecycle notifications.
    pub fn with_connection_events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Bound on reassembled fragmented requests.
    pub fn with_max_fragment_size(mut self, max_fragment_size: usize) -> Self {
        self.max_fragment_size = max_fragment_size;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Role fixed at construction.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed)
    }

    /// Whether the connection is detached or closed.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Closed
        )
    }

    /// Keepalive timer bookkeeping, present once connected.
    pub fn keepalive_timer(&self) -> Option<&KeepaliveTimer> {
        self.keepalive.as_ref()
    }

    /// Number of live stream entries.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Connect as a client: attach the transport and send SETUP.
    pub fn connect_client(
        &mut self,
        transport: Arc<dyn FrameTransport>,
        params: SetupParameters,
    ) -> Result<()> {
        if !matches!(self.state, ConnectionState::Disconnected) {
            return Err(RSocketError::Protocol(
                "connect on a connection that is not disconnected".to_string(),
            ));
        }
        self.serializer = Some(FrameSerializer::new(params.version)?);
        self.is_resumable = params.is_resumable();
        self.honors_lease = params.honors_lease;
        self.keepalive = Some(KeepaliveTimer::new(
            params.keepalive_interval,
            params.max_lifetime,
            Instant::now(),
        ));
        self.transport = Some(transport);
        self.state = ConnectionState::Connecting;

        let setup = Frame::Setup(params.to_frame());
        if let Err(err) = self.output_frame(setup) {
            self.close_frame_transport(Some("setup send failed".to_string()));
            self.state = ConnectionState::Disconnected;
            return Err(err);
        }

        self.state = ConnectionState::Connected;
        debug!(role = ?self.role, "connection established");
        if let Some(events) = &self.events {
            events.on_connected();
        }
        self.send_pending_frames();
        Ok(())
    }

    /// Connect as a server from an already-received SETUP.
    pub fn connect_server(
        &mut self,
        transport: Arc<dyn FrameTransport>,
        params: SetupParameters,
    ) -> Result<()> {
        if !matches!(self.state, ConnectionState::Disconnected) {
            return Err(RSocketError::Protocol(
                "connect on a connection that is not disconnected".to_string(),
            ));
        }
        if !params.version.is_supported() {
            // answer in the only version this build can encode
            self.serializer = Some(FrameSerializer::new(ProtocolVersion::V1_0)?);
            self.transport = Some(transport);
            let message = format!("cannot support protocol version {}", params.version);
            self.close_with_error(ErrorFrame::unsupported_setup(&message));
            return Err(RSocketError::UnsupportedSetup(message));
        }

        self.serializer = Some(FrameSerializer::new(params.version)?);
        self.is_resumable = params.is_resumable();
        self.keepalive = Some(KeepaliveTimer::new(
            params.keepalive_interval,
            params.max_lifetime,
            Instant::now(),
        ));
        self.transport = Some(transport);
        self.state = ConnectionState::Connected;
        debug!(role = ?self.role, "connection established");
        if let Some(events) = &self.events {
            events.on_connected();
        }
        Ok(())
    }

    /// Resume as a client: send RESUME and wait for the peer's verdict.
    ///
    /// `callback` fires with `Ok` on RESUME_OK and with `Err` when the peer
    /// rejects the resumption or the connection dies first. A still-bound
    /// previous transport is replaced atomically.
    pub fn resume_client(
        &mut self,
        token: ResumeToken,
        transport: Arc<dyn FrameTransport>,
        callback: oneshot::Sender<Result<()>>,
        version: ProtocolVersion,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(RSocketError::ConnectionClosed);
        }
        if !self.is_resumable {
            return Err(RSocketError::Protocol(
                "resume on a connection that is not resumable".to_string(),
            ));
        }
        if self.serializer.is_none() {
            self.serializer = Some(FrameSerializer::new(version)?);
        }
        if let Some(old) = self.transport.take() {
            old.close(Some("replaced by resume transport".to_string()));
        }
        self.transport = Some(transport);
        self.state = ConnectionState::Resuming;
        self.resume_callback = Some(callback);
        if let Some(timer) = self.keepalive.as_mut() {
            timer.record_activity(Instant::now());
        }

        let resume = Frame::Resume(ResumeFrame {
            version,
            token,
            last_received_server_position: self.resume_manager.last_received_position(),
            first_client_position: self.resume_manager.first_sent_position(),
        });
        self.output_frame(resume)
    }

    /// Resume as a server from an already-received RESUME.
    ///
    /// Returns whether the resumption was accepted. On success RESUME_OK is
    /// sent and the cached frames from the requested position are replayed;
    /// on failure the connection closes with REJECTED_RESUME.
    pub fn resume_server(
        &mut self,
        transport: Arc<dyn FrameTransport>,
        params: ResumeParameters,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        if let Some(old) = self.transport.take() {
            old.close(Some("replaced by resume transport".to_string()));
        }
        self.transport = Some(transport);

        let server_position_ok = self
            .resume_manager
            .is_position_available(params.last_received_server_position);
        let client_position_ok =
            params.first_client_position <= self.resume_manager.last_received_position();
        if !server_position_ok || !client_position_ok {
            warn!(
                requested = params.last_received_server_position,
                retained_from = self.resume_manager.first_sent_position(),
                "rejecting resume"
            );
            self.close_with_error(ErrorFrame::rejected_resume(
                "requested position is no longer retained",
            ));
            return false;
        }

        self.state = ConnectionState::Connected;
        if let Some(timer) = self.keepalive.as_mut() {
            timer.record_activity(Instant::now());
        }
        let resume_ok = Frame::ResumeOk(ResumeOkFrame {
            position: self.resume_manager.last_received_position(),
        });
        if let Err(err) = self.output_frame(resume_ok) {
            warn!(%err, "failed to acknowledge resume");
            self.disconnect_or_close_with_error(ErrorFrame::connection_error(
                "transport write failed",
            ));
            return false;
        }
        self.resume_from_position(params.last_received_server_position);
        self.send_pending_frames();
        if let Some(events) = &self.events {
            events.on_connected();
        }
        true
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Detach the transport; streams and caches survive when resumable,
    /// otherwise this closes the connection with `cause`.
    pub fn disconnect(&mut self, cause: RSocketError) {
        if self.is_closed() {
            return;
        }
        if self.is_resumable {
            self.disconnect_internal();
        } else {
            self.close(cause, StreamSignal::ConnectionError);
        }
    }

    /// Send ERROR on stream 0, close every stream with a connection-error
    /// signal, release the transport, and enter `Closed`.
    pub fn close_with_error(&mut self, error: ErrorFrame) {
        if self.is_closed() {
            return;
        }
        warn!(code = %error.code, message = %error.message(), "closing connection with error");
        if self.serializer.is_none() {
            // version detection failed before negotiation; answer in the
            // only version this build encodes
            self.serializer = FrameSerializer::new(ProtocolVersion::V1_0).ok();
        }
        let cause = RSocketError::Stream {
            code: error.code,
            message: error.message(),
        };
        let _ = self.output_frame(Frame::Error(error));
        self.close(cause, StreamSignal::ConnectionError);
    }

    /// Resumable connections disconnect; everything else closes with the
    /// error.
    pub fn disconnect_or_close_with_error(&mut self, error: ErrorFrame) {
        if self.is_resumable {
            self.disconnect(RSocketError::Stream {
                code: error.code,
                message: error.message(),
            });
        } else {
            self.close_with_error(error);
        }
    }

    /// Close without emitting a frame (transport already unusable).
    pub fn close(&mut self, cause: RSocketError, signal: StreamSignal) {
        if self.is_closed() {
            return;
        }
        debug!(%cause, "closing connection");
        self.state = ConnectionState::Closed;
        if let Some(callback) = self.resume_callback.take() {
            let _ = callback.send(Err(RSocketError::ConnectionClosed));
        }
        self.close_streams(signal);
        self.stream_fragments.clear();
        self.pending_frames.clear();
        self.close_frame_transport(Some(cause.to_string()));
        if let Some(events) = &self.events {
            events.on_closed();
        }
    }

    /// The transport observed a terminal condition.
    pub fn on_transport_terminal(&mut self, cause: RSocketError) {
        if self.is_closed() {
            return;
        }
        debug!(%cause, "transport terminal");
        if self.is_resumable {
            self.disconnect_internal();
        } else {
            self.close(cause, StreamSignal::ConnectionError);
        }
    }

    fn disconnect_internal(&mut self) {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Resuming
        ) {
            return;
        }
        debug!("detaching transport, connection stays resumable");
        self.close_frame_transport(None);
        self.state = ConnectionState::Disconnected;
        if let Some(events) = &self.events {
            events.on_disconnected();
        }
    }

    fn close_frame_transport(&mut self, cause: Option<String>) {
        if let Some(transport) = self.transport.take() {
            transport.close(cause);
        }
    }

    fn close_streams(&mut self, signal: StreamSignal) {
        for (stream_id, mut machine) in self.streams.drain() {
            machine.close(signal);
            if let Some(events) = &self.events {
                events.on_stream_closed(stream_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Requester operations
    // ------------------------------------------------------------------

    /// Send a REQUEST_FNF on a freshly allocated stream id.
    pub fn fire_and_forget(&mut self, payload: Payload) -> Result<()> {
        self.check_can_request()?;
        let stream_id = self.streams_factory.next_stream_id()?;
        self.write_frame(Frame::RequestFnf(RequestFnfFrame {
            stream_id,
            follows: false,
            payload,
        }))
    }

    /// Send a METADATA_PUSH on stream 0.
    pub fn metadata_push(&mut self, metadata: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(RSocketError::ConnectionClosed);
        }
        self.write_frame(Frame::MetadataPush(MetadataPushFrame { metadata }))
    }

    /// Open a request/response stream; the receiver resolves with the
    /// response payload or the stream error.
    pub fn request_response(
        &mut self,
        payload: Payload,
    ) -> Result<oneshot::Receiver<Result<Payload>>> {
        self.check_can_request()?;
        let (stream_id, machine, rx) = self.streams_factory.create_request_response()?;
        self.add_stream(stream_id, machine)?;
        if let Err(err) = self.write_frame(Frame::RequestResponse(RequestResponseFrame {
            stream_id,
            follows: false,
            payload,
        })) {
            self.streams.remove(&stream_id);
            return Err(err);
        }
        Ok(rx)
    }

    /// Open a request/stream; the receiver observes elements, completion
    /// and errors.
    pub fn request_stream(
        &mut self,
        payload: Payload,
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<StreamEvent>> {
        self.check_can_request()?;
        let (stream_id, machine, rx) = self.streams_factory.create_request_stream()?;
        self.add_stream(stream_id, machine)?;
        if let Err(err) = self.write_frame(Frame::RequestStream(RequestStreamFrame {
            stream_id,
            follows: false,
            initial_request_n: MAX_U31,
            payload,
        })) {
            self.streams.remove(&stream_id);
            return Err(err);
        }
        Ok(rx)
    }

    /// Open a request/channel; the sink drives the local direction, the
    /// receiver observes the remote one.
    pub fn request_channel(
        &mut self,
        payload: Payload,
    ) -> Result<(StreamSink, tokio::sync::mpsc::UnboundedReceiver<StreamEvent>)> {
        self.check_can_request()?;
        let (stream_id, machine, rx) = self.streams_factory.create_request_channel()?;
        self.add_stream(stream_id, machine)?;
        if let Err(err) = self.write_frame(Frame::RequestChannel(RequestChannelFrame {
            stream_id,
            follows: false,
            complete: false,
            initial_request_n: MAX_U31,
            payload,
        })) {
            self.streams.remove(&stream_id);
            return Err(err);
        }
        Ok((StreamSink::new(stream_id, self.sink_tx.clone()), rx))
    }

    /// Cancel a locally-initiated stream: emit CANCEL and drop the entry.
    pub fn cancel_stream(&mut self, stream_id: StreamId) -> Result<()> {
        if !self.streams.contains_key(&stream_id) {
            return Ok(());
        }
        self.write_frame(Frame::Cancel(CancelFrame { stream_id }))?;
        self.end_stream_internal(stream_id, StreamSignal::Cancel);
        Ok(())
    }

    /// Grant the peer `n` more elements on a stream.
    pub fn request_n(&mut self, stream_id: StreamId, n: u32) -> Result<()> {
        if !self.streams.contains_key(&stream_id) {
            return Ok(());
        }
        self.write_frame(Frame::RequestN(RequestNFrame {
            stream_id,
            request_n: n,
        }))
    }

    /// Register a stream entry. Emits no frames.
    ///
    /// Precondition: the id is non-zero and not currently present.
    pub fn add_stream(&mut self, stream_id: StreamId, machine: StreamStateMachine) -> Result<()> {
        if stream_id == CONNECTION_STREAM_ID {
            return Err(RSocketError::ReservedStreamId);
        }
        if self.streams.contains_key(&stream_id) || self.stream_fragments.contains_key(&stream_id)
        {
            return Err(RSocketError::Protocol(format!(
                "stream {} already exists",
                stream_id
            )));
        }
        self.streams.insert(stream_id, machine);
        Ok(())
    }

    /// Emit a KEEPALIVE with the RESPOND flag set.
    pub fn send_keepalive(&mut self, data: Bytes) -> Result<()> {
        let frame = Frame::Keepalive(KeepaliveFrame {
            respond: true,
            last_received_position: self.resume_manager.last_received_position(),
            data,
        });
        self.write_frame(frame)
    }

    /// Periodic tick from the driver: detect keepalive timeout, otherwise
    /// probe the peer.
    pub fn on_keepalive_tick(&mut self, now: Instant) {
        if !matches!(self.state, ConnectionState::Connected) {
            return;
        }
        let dead = self.keepalive.as_ref().is_some_and(|t| t.is_dead(now));
        if dead {
            warn!("no inbound activity within max lifetime");
            self.disconnect_or_close_with_error(ErrorFrame::connection_error(
                "keepalive timeout",
            ));
            return;
        }
        if let Err(err) = self.send_keepalive(Bytes::new()) {
            warn!(%err, "keepalive send failed");
            self.disconnect_or_close_with_error(ErrorFrame::connection_error(
                "transport write failed",
            ));
        }
    }

    fn check_can_request(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(RSocketError::ConnectionClosed);
        }
        if self.honors_lease {
            match self.lease_permits.as_mut() {
                Some(permits) if *permits > 0 => *permits -= 1,
                _ => return Err(RSocketError::LeaseExhausted),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound routing
    // ------------------------------------------------------------------

    /// Process one complete inbound frame buffer (length prefix stripped).
    pub fn process_frame(&mut self, buf: Bytes) {
        if self.is_closed() {
            return;
        }
        if self.serializer.is_none() {
            match FrameSerializer::detect_version(&buf)
                .and_then(|version| FrameSerializer::new(version).ok())
            {
                Some(serializer) => {
                    debug!(version = %serializer.version(), "auto-detected protocol version");
                    self.serializer = Some(serializer);
                }
                None => {
                    self.close_with_error(ErrorFrame::invalid_setup(
                        "could not detect protocol version",
                    ));
                    return;
                }
            }
        }
        let decoded = self.serializer.as_ref().map(|s| s.deserialize(buf.clone()));
        let frame = match decoded {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                debug!(%err, "frame deserialization failed");
                self.close_with_error(ErrorFrame::connection_error("Invalid frame"));
                return;
            }
            None => return,
        };

        if self.is_resumable && frame.is_resumable() {
            self.resume_manager.track_received_frame(buf.len());
        }
        if let Some(timer) = self.keepalive.as_mut() {
            timer.record_activity(Instant::now());
        }
        trace!(
            stream_id = frame.stream_id(),
            frame_type = %frame.frame_type(),
            "frame received"
        );

        if frame.stream_id() == CONNECTION_STREAM_ID {
            self.handle_connection_frame(frame);
        } else {
            self.handle_stream_frame(frame);
        }
    }

    /// Apply an application intent posted through a stream sink.
    ///
    /// Events for streams that have already terminated are dropped.
    pub fn on_sink_event(&mut self, stream_id: StreamId, event: SinkEvent) {
        let output = match self.streams.get_mut(&stream_id) {
            Some(machine) => machine.on_sink_event(event),
            None => {
                trace!(stream_id, "sink event for terminated stream dropped");
                return;
            }
        };
        self.apply_stream_output(stream_id, output);
    }

    fn handle_connection_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Keepalive(keepalive) => {
                if self.is_resumable {
                    self.resume_manager
                        .release_frames(keepalive.last_received_position);
                }
                if keepalive.respond {
                    let echo = Frame::Keepalive(KeepaliveFrame {
                        respond: false,
                        last_received_position: self.resume_manager.last_received_position(),
                        data: keepalive.data,
                    });
                    if let Err(err) = self.write_frame(echo) {
                        warn!(%err, "keepalive echo failed");
                        self.disconnect_or_close_with_error(ErrorFrame::connection_error(
                            "transport write failed",
                        ));
                    }
                }
            }
            Frame::Error(error) => {
                warn!(code = %error.code, message = %error.message(), "connection error from peer");
                if let Some(callback) = self.resume_callback.take() {
                    let _ = callback.send(Err(RSocketError::RejectedResume(error.message())));
                }
                self.close(
                    RSocketError::Stream {
                        code: error.code,
                        message: error.message(),
                    },
                    StreamSignal::ConnectionError,
                );
            }
            Frame::MetadataPush(push) => self.responder.handle_metadata_push(push.metadata),
            Frame::Lease(lease) => {
                debug!(
                    ttl_ms = lease.ttl_ms,
                    permits = lease.number_of_requests,
                    "lease received"
                );
                self.lease_permits = Some(lease.number_of_requests);
            }
            Frame::ResumeOk(resume_ok) => self.handle_resume_ok(resume_ok.position),
            Frame::Setup(_) | Frame::Resume(_) => {
                self.close_with_error(ErrorFrame::connection_error(
                    "SETUP or RESUME on an established connection",
                ));
            }
            Frame::Ext(ext) => {
                debug!(extended_type = ext.extended_type, "extension frame ignored");
            }
            other => {
                self.close_with_error(ErrorFrame::connection_error(&format!(
                    "unexpected {} frame on stream 0",
                    other.frame_type()
                )));
            }
        }
    }

    fn handle_resume_ok(&mut self, position: u64) {
        if !matches!(self.state, ConnectionState::Resuming) {
            self.close_with_error(ErrorFrame::connection_error(
                "RESUME_OK on an established connection",
            ));
            return;
        }
        if !self.resume_manager.is_position_available(position) {
            if let Some(callback) = self.resume_callback.take() {
                let _ = callback.send(Err(RSocketError::RejectedResume(format!(
                    "peer acknowledged position {} outside the retained window",
                    position
                ))));
            }
            self.close_with_error(ErrorFrame::connection_error(
                "cannot replay from the acknowledged position",
            ));
            return;
        }
        debug!(position, "resume acknowledged");
        self.state = ConnectionState::Connected;
        if let Some(callback) = self.resume_callback.take() {
            let _ = callback.send(Ok(()));
        }
        self.resume_from_position(position);
        self.send_pending_frames();
        if let Some(events) = &self.events {
            events.on_connected();
        }
    }

    fn handle_stream_frame(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();

        if self.streams.contains_key(&stream_id) {
            if frame.frame_type().is_new_stream_frame() {
                self.close_with_error(ErrorFrame::connection_error("stream id reused"));
                return;
            }
            let output = match self.streams.get_mut(&stream_id) {
                Some(machine) => machine.on_frame(frame),
                None => return,
            };
            self.apply_stream_output(stream_id, output);
            return;
        }

        if self.stream_fragments.contains_key(&stream_id) {
            self.handle_fragment_continuation(stream_id, frame);
            return;
        }

        self.handle_unknown_stream(stream_id, frame);
    }

    fn handle_fragment_continuation(&mut self, stream_id: StreamId, frame: Frame) {
        match frame {
            Frame::Payload(fragment) => {
                let follows = fragment.follows;
                let appended = match self.stream_fragments.get_mut(&stream_id) {
                    Some(accumulator) => accumulator.append(&fragment),
                    None => return,
                };
                if let Err(err) = appended {
                    warn!(stream_id, %err, "dropping oversized fragmented request");
                    self.stream_fragments.remove(&stream_id);
                    self.reject_stream(stream_id, "fragmented request too large");
                    return;
                }
                if !follows {
                    if let Some(accumulator) = self.stream_fragments.remove(&stream_id) {
                        self.handle_new_stream(accumulator.finalize());
                    }
                }
            }
            Frame::Cancel(_) => {
                debug!(stream_id, "reassembly canceled");
                self.stream_fragments.remove(&stream_id);
            }
            other => {
                self.close_with_error(ErrorFrame::connection_error(&format!(
                    "unexpected {} frame during request reassembly",
                    other.frame_type()
                )));
            }
        }
    }

    fn handle_unknown_stream(&mut self, stream_id: StreamId, frame: Frame) {
        let frame_type = frame.frame_type();
        if frame_type.is_new_stream_frame() {
            if !self.streams_factory.is_valid_remote_stream_id(stream_id) {
                self.close_with_error(ErrorFrame::connection_error(
                    "stream id parity violation",
                ));
                return;
            }
            if frame.follows() {
                match FragmentAccumulator::new(frame, self.max_fragment_size) {
                    Ok(accumulator) => {
                        self.stream_fragments.insert(stream_id, accumulator);
                    }
                    Err(err) => {
                        warn!(stream_id, %err, "rejecting fragmented request");
                        self.reject_stream(stream_id, "fragmented request too large");
                    }
                }
                return;
            }
            self.handle_new_stream(frame);
            return;
        }

        match frame_type {
            FrameType::Cancel | FrameType::Error | FrameType::RequestN | FrameType::Payload => {
                debug!(
                    stream_id,
                    frame_type = %frame_type,
                    "frame for unknown stream discarded"
                );
            }
            _ => {
                self.close_with_error(ErrorFrame::connection_error(&format!(
                    "unexpected {} frame for unknown stream",
                    frame_type
                )));
            }
        }
    }

    fn handle_new_stream(&mut self, frame: Frame) {
        match frame {
            Frame::RequestFnf(request) => {
                self.responder.handle_fire_and_forget(request.payload);
            }
            Frame::RequestResponse(request) => {
                let stream_id = request.stream_id;
                let machine = StreamStateMachine::request_response_responder(stream_id);
                if self.add_stream(stream_id, machine).is_err() {
                    self.close_with_error(ErrorFrame::connection_error("stream id reused"));
                    return;
                }
                let sink = StreamSink::new(stream_id, self.sink_tx.clone());
                self.responder.handle_request_response(request.payload, sink);
            }
            Frame::RequestStream(request) => {
                let stream_id = request.stream_id;
                let machine =
                    StreamStateMachine::stream_responder(stream_id, request.initial_request_n);
                if self.add_stream(stream_id, machine).is_err() {
                    self.close_with_error(ErrorFrame::connection_error("stream id reused"));
                    return;
                }
                let sink = StreamSink::new(stream_id, self.sink_tx.clone());
                self.responder.handle_request_stream(request.payload, sink);
            }
            Frame::RequestChannel(request) => {
                let stream_id = request.stream_id;
                let (machine, inbound_rx) =
                    StreamStateMachine::channel_responder(stream_id, request.initial_request_n);
                if self.add_stream(stream_id, machine).is_err() {
                    self.close_with_error(ErrorFrame::connection_error("stream id reused"));
                    return;
                }
                if request.complete {
                    let output = match self.streams.get_mut(&stream_id) {
                        Some(machine) => machine.on_frame(Frame::Payload(PayloadFrame {
                            stream_id,
                            follows: false,
                            complete: true,
                            next: false,
                            payload: Payload::default(),
                        })),
                        None => StreamOutput::default(),
                    };
                    self.apply_stream_output(stream_id, output);
                }
                let sink = StreamSink::new(stream_id, self.sink_tx.clone());
                self.responder
                    .handle_request_channel(request.payload, inbound_rx, sink);
            }
            other => {
                self.close_with_error(ErrorFrame::connection_error(&format!(
                    "{} frame cannot open a stream",
                    other.frame_type()
                )));
            }
        }
    }

    fn reject_stream(&mut self, stream_id: StreamId, message: &str) {
        match ErrorFrame::rejected(stream_id, message) {
            Ok(error) => {
                if let Err(err) = self.write_frame(Frame::Error(error)) {
                    warn!(%err, "stream rejection failed");
                }
            }
            Err(err) => warn!(%err, "cannot build rejection frame"),
        }
    }

    fn apply_stream_output(&mut self, stream_id: StreamId, output: StreamOutput) {
        for frame in output.frames {
            if let Err(err) = self.write_frame(frame) {
                warn!(stream_id, %err, "stream frame write failed");
                self.disconnect_or_close_with_error(ErrorFrame::connection_error(
                    "transport write failed",
                ));
                return;
            }
        }
        if let Some(signal) = output.terminal {
            self.end_stream_internal(stream_id, signal);
        }
    }

    /// Remove a stream entry and deliver the signal to its machine.
    ///
    /// Idempotent; returns false iff no entry was found.
    fn end_stream_internal(&mut self, stream_id: StreamId, signal: StreamSignal) -> bool {
        match self.streams.remove(&stream_id) {
            Some(mut machine) => {
                machine.close(signal);
                if let Some(events) = &self.events {
                    events.on_stream_closed(stream_id);
                }
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Outbound writer
    // ------------------------------------------------------------------

    /// Whether the frame must wait for a transport.
    ///
    /// While disconnected or resuming everything except the resume control
    /// frames is buffered and drained in FIFO order once connected.
    fn should_queue(&self, frame: &Frame) -> bool {
        matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Resuming
        ) && !matches!(
            frame.frame_type(),
            FrameType::Resume | FrameType::ResumeOk
        )
    }

    /// Serialize and send a frame, or buffer it while no transport is
    /// usable.
    pub fn write_frame(&mut self, frame: Frame) -> Result<()> {
        if self.should_queue(&frame) {
            trace!(frame_type = %frame.frame_type(), "frame buffered until reconnect");
            self.pending_frames.push_back(frame);
            return Ok(());
        }
        self.output_frame(frame)
    }

    fn output_frame(&mut self, frame: Frame) -> Result<()> {
        let serializer = self
            .serializer
            .as_ref()
            .ok_or_else(|| RSocketError::Protocol("no protocol version negotiated".to_string()))?;
        let bytes = serializer.serialize(&frame)?;
        if self.is_resumable && frame.is_resumable() {
            self.resume_manager.track_sent_frame(bytes.clone());
        }
        let transport = self
            .transport
            .as_ref()
            .ok_or(RSocketError::ConnectionClosed)?;
        transport.send(bytes)
    }

    fn send_pending_frames(&mut self) {
        while let Some(frame) = self.pending_frames.pop_front() {
            if let Err(err) = self.output_frame(frame) {
                warn!(%err, "pending frame flush failed");
                self.disconnect_or_close_with_error(ErrorFrame::connection_error(
                    "transport write failed",
                ));
                return;
            }
        }
    }

    fn resume_from_position(&mut self, position: u64) {
        let frames = self.resume_manager.frames_from_position(position);
        debug!(count = frames.len(), position, "replaying cached frames");
        if let Some(transport) = &self.transport {
            for bytes in frames {
                if let Err(err) = transport.send(bytes) {
                    warn!(%err, "replay send failed");
                    break;
                }
            }
        }
    }
}
