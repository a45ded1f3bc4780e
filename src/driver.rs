//! Connection driver: the single logical executor.
//!
//! The driver task owns a [`RSocketStateMachine`] and serializes everything
//! that touches it: transport reads, sink events from responders, user
//! commands, and keepalive ticks. Callers hold a cheap [`ConnectionHandle`]
//! and hop onto the executor through its command channel.
//!
//! ```text
//! reader ──┐
//! sinks  ──┼─► driver task ─► RSocketStateMachine ─► writer task ─► socket
//! handle ──┤
//! ticks  ──┘
//! ```
//!
//! The driver serves connections on a single transport; resumable sessions
//! that hop transports drive the state machine directly instead.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::RSocketStateMachine;
use crate::error::{RSocketError, Result};
use crate::frame::{ErrorFrame, Frame, FrameSerializer, Payload, StreamId};
use crate::responder::Responder;
use crate::setup::SetupParameters;
use crate::stream::{sink_channel, Role, SinkEventReceiver, StreamEvent, StreamSignal, StreamSink};
use crate::transport::{spawn_writer_task, FrameBuffer, FrameTransport};

enum Command {
    FireAndForget(Payload, oneshot::Sender<Result<()>>),
    MetadataPush(Bytes, oneshot::Sender<Result<()>>),
    RequestResponse(
        Payload,
        oneshot::Sender<Result<oneshot::Receiver<Result<Payload>>>>,
    ),
    RequestStream(
        Payload,
        oneshot::Sender<Result<mpsc::UnboundedReceiver<StreamEvent>>>,
    ),
    RequestChannel(
        Payload,
        oneshot::Sender<Result<(StreamSink, mpsc::UnboundedReceiver<StreamEvent>)>>,
    ),
    CancelStream(StreamId),
    Close(oneshot::Sender<()>),
}

/// Cheap, cloneable handle for issuing requests on a driven connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    fn dispatch<'a, T: 'a>(
        &'a self,
        command: Command,
        rx: oneshot::Receiver<Result<T>>,
    ) -> impl std::future::Future<Output = Result<T>> + 'a {
        let sent = self.cmd_tx.send(command).is_ok();
        async move {
            if !sent {
                return Err(RSocketError::ConnectionClosed);
            }
            rx.await.map_err(|_| RSocketError::ConnectionClosed)?
        }
    }

    /// Issue a fire-and-forget request.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::FireAndForget(payload, tx), rx).await
    }

    /// Push connection-level metadata.
    pub async fn metadata_push(&self, metadata: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::MetadataPush(metadata, tx), rx).await
    }

    /// Issue a request/response and await the answer.
    pub async fn request_response(&self, payload: Payload) -> Result<Payload> {
        let (tx, rx) = oneshot::channel();
        let reply = self.dispatch(Command::RequestResponse(payload, tx), rx).await?;
        reply.await.map_err(|_| RSocketError::ConnectionClosed)?
    }

    /// Issue a request/stream and return the event receiver.
    pub async fn request_stream(
        &self,
        payload: Payload,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::RequestStream(payload, tx), rx).await
    }

    /// Open a request/channel; the sink drives the local direction.
    pub async fn request_channel(
        &self,
        payload: Payload,
    ) -> Result<(StreamSink, mpsc::UnboundedReceiver<StreamEvent>)> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::RequestChannel(payload, tx), rx).await
    }

    /// Cancel a locally-initiated stream.
    pub fn cancel(&self, stream_id: StreamId) {
        let _ = self.cmd_tx.send(Command::CancelStream(stream_id));
    }

    /// Close the connection and wait for the driver to wind down.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the driver has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// A connection being driven on its own task.
pub struct RSocketConnection {
    handle: ConnectionHandle,
    driver: JoinHandle<()>,
}

impl RSocketConnection {
    /// Handle for issuing requests.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Wait until the connection terminates.
    pub async fn closed(self) {
        let _ = self.driver.await;
    }
}

/// Connect as a client over any duplex byte stream.
///
/// Sends SETUP and spawns the writer and driver tasks.
pub async fn connect<S>(
    io: S,
    params: SetupParameters,
    responder: Arc<dyn Responder>,
) -> Result<RSocketConnection>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    let (transport, _writer_task) = spawn_writer_task(writer);
    let (sink_tx, sink_rx) = sink_channel();
    let keepalive_period = params.keepalive_interval;

    let mut machine = RSocketStateMachine::new(Role::Client, responder, sink_tx);
    machine.connect_client(transport, params)?;

    Ok(spawn_driver(
        machine,
        reader,
        FrameBuffer::new(),
        sink_rx,
        keepalive_period,
    ))
}

/// Accept as a server over any duplex byte stream.
///
/// Reads the first frame, negotiates the protocol version from it, applies
/// the SETUP, and spawns the writer and driver tasks. A RESUME first frame
/// is answered with REJECTED_RESUME: a fresh acceptor holds no session to
/// resume.
pub async fn accept<S>(io: S, responder: Arc<dyn Responder>) -> Result<RSocketConnection>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(io);

    let mut frame_buffer = FrameBuffer::new();
    let mut first_frames = Vec::new();
    let mut read_buf = vec![0u8; 16 * 1024];
    while first_frames.is_empty() {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            return Err(RSocketError::ConnectionClosed);
        }
        first_frames = frame_buffer.push(&read_buf[..n])?;
    }
    let first = first_frames.remove(0);

    let version = FrameSerializer::detect_version(&first).ok_or_else(|| {
        RSocketError::InvalidFrame("could not detect protocol version".to_string())
    })?;
    let serializer = FrameSerializer::new(version)?;
    let frame = serializer.deserialize(first)?;

    let (transport, _writer_task) = spawn_writer_task(writer);
    let (sink_tx, sink_rx) = sink_channel();
    let mut machine = RSocketStateMachine::new(Role::Server, responder, sink_tx);

    let keepalive_period = match frame {
        Frame::Setup(setup) => {
            let params = SetupParameters::from_frame(setup);
            let period = params.keepalive_interval;
            machine.connect_server(transport, params)?;
            period
        }
        Frame::Resume(_) => {
            let message = "no session to resume";
            let error = Frame::Error(ErrorFrame::rejected_resume(message));
            if let Ok(bytes) = serializer.serialize(&error) {
                let _ = transport.send(bytes);
            }
            transport.close(Some(message.to_string()));
            return Err(RSocketError::RejectedResume(message.to_string()));
        }
        other => {
            transport.close(Some("handshake expected".to_string()));
            return Err(RSocketError::Protocol(format!(
                "{} frame instead of SETUP",
                other.frame_type()
            )));
        }
    };

    for leftover in first_frames {
        machine.process_frame(leftover);
    }

    Ok(spawn_driver(
        machine,
        reader,
        frame_buffer,
        sink_rx,
        keepalive_period,
    ))
}

fn spawn_driver<R>(
    machine: RSocketStateMachine,
    reader: R,
    frame_buffer: FrameBuffer,
    sink_rx: SinkEventReceiver,
    keepalive_period: Duration,
) -> RSocketConnection
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let driver = tokio::spawn(driver_loop(
        machine,
        reader,
        frame_buffer,
        sink_rx,
        cmd_rx,
        keepalive_period,
    ));
    RSocketConnection {
        handle: ConnectionHandle { cmd_tx },
        driver,
    }
}

async fn driver_loop<R>(
    mut machine: RSocketStateMachine,
    mut reader: R,
    mut frame_buffer: FrameBuffer,
    mut sink_rx: SinkEventReceiver,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    keepalive_period: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut read_buf = vec![0u8; 64 * 1024];
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + keepalive_period, keepalive_period);

    loop {
        tokio::select! {
            read = reader.read(&mut read_buf) => match read {
                Ok(0) => machine.on_transport_terminal(RSocketError::ConnectionClosed),
                Ok(n) => match frame_buffer.push(&read_buf[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            machine.process_frame(frame);
                        }
                    }
                    Err(err) => {
                        debug!(%err, "transport framing error");
                        machine.close_with_error(ErrorFrame::connection_error("Invalid frame"));
                    }
                },
                Err(err) => machine.on_transport_terminal(err.into()),
            },
            Some((stream_id, event)) = sink_rx.recv() => {
                machine.on_sink_event(stream_id, event);
            }
            command = cmd_rx.recv() => match command {
                Some(command) => apply_command(&mut machine, command),
                None => {
                    machine.close(
                        RSocketError::ConnectionClosed,
                        StreamSignal::ConnectionError,
                    );
                }
            },
            _ = keepalive.tick() => machine.on_keepalive_tick(Instant::now()),
        }

        if machine.is_disconnected() {
            break;
        }
    }
    debug!("connection driver finished");
}

fn apply_command(machine: &mut RSocketStateMachine, command: Command) {
    match command {
        Command::FireAndForget(payload, reply) => {
            let _ = reply.send(machine.fire_and_forget(payload));
        }
        Command::MetadataPush(metadata, reply) => {
            let _ = reply.send(machine.metadata_push(metadata));
        }
        Command::RequestResponse(payload, reply) => {
            let _ = reply.send(machine.request_response(payload));
        }
        Command::RequestStream(payload, reply) => {
            let _ = reply.send(machine.request_stream(payload));
        }
        Command::RequestChannel(payload, reply) => {
            let _ = reply.send(machine.request_channel(payload));
        }
        Command::CancelStream(stream_id) => {
            if let Err(err) = machine.cancel_stream(stream_id) {
                warn!(stream_id, %err, "cancel failed");
            }
        }
        Command::Close(done) => {
            machine.close(
                RSocketError::ConnectionClosed,
                StreamSignal::ConnectionError,
            );
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::Responder;

    struct EchoResponder;

    impl Responder for EchoResponder {
        fn handle_request_response(&self, payload: Payload, sink: StreamSink) {
            sink.payload(payload);
        }

        fn handle_request_stream(&self, payload: Payload, sink: StreamSink) {
            for _ in 0..3 {
                sink.payload(payload.clone());
            }
            sink.complete();
        }
    }

    #[tokio::test]
    async fn test_request_response_end_to_end() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(accept(server_io, Arc::new(EchoResponder)));
        let client = connect(client_io, SetupParameters::default(), Arc::new(EchoResponder))
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();

        let response = client
            .handle()
            .request_response(Payload::from_static("echo me"))
            .await
            .unwrap();
        assert_eq!(&response.data[..], b"echo me");

        client.handle().close().await;
        drop(server);
    }

    #[tokio::test]
    async fn test_request_stream_end_to_end() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(accept(server_io, Arc::new(EchoResponder)));
        let client = connect(client_io, SetupParameters::default(), Arc::new(EchoResponder))
            .await
            .unwrap();
        let _server = server.await.unwrap().unwrap();

        let mut events = client
            .handle()
            .request_stream(Payload::from_static("element"))
            .await
            .unwrap();

        let mut elements = 0;
        loop {
            match events.recv().await {
                Some(StreamEvent::Payload(payload)) => {
                    assert_eq!(&payload.data[..], b"element");
                    elements += 1;
                }
                Some(StreamEvent::Complete) => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(elements, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout_tears_the_connection_down() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let client = connect(client_io, SetupParameters::default(), Arc::new(EchoResponder))
            .await
            .unwrap();
        let handle = client.handle();

        // the peer never answers; the paused clock races through the
        // keepalive ticks until max lifetime expires
        let _silent_peer = server_io;
        client.closed().await;

        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_handle_reports_closed_after_close() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(accept(server_io, Arc::new(EchoResponder)));
        let client = connect(client_io, SetupParameters::default(), Arc::new(EchoResponder))
            .await
            .unwrap();
        let _server = server.await.unwrap().unwrap();

        let handle = client.handle();
        handle.close().await;
        client.closed().await;

        assert!(handle.is_closed());
        assert!(handle
            .fire_and_forget(Payload::from_static("late"))
            .await
            .is_err());
    }
}
