//! Protocol scenarios driven through two state machines wired back to back.
//!
//! Each peer owns a channel transport; the harness pumps frames between the
//! machines and drains responder sinks until the exchange reaches a
//! fixpoint, which keeps every scenario deterministic.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use rsocket_core::codec::{MsgPackCodec, MIME_MSGPACK};
use rsocket_core::connection::{ConnectionState, RSocketStateMachine};
use rsocket_core::error::{ErrorCode, RSocketError};
use rsocket_core::frame::{
    Frame, FrameSerializer, Payload, PayloadFrame, RequestStreamFrame,
};
use rsocket_core::responder::Responder;
use rsocket_core::setup::{ProtocolVersion, ResumeParameters, ResumeToken, SetupParameters};
use rsocket_core::stream::{sink_channel, Role, SinkEventReceiver, StreamEvent, StreamSink};
use rsocket_core::transport::ChannelFrameTransport;

fn serializer() -> FrameSerializer {
    FrameSerializer::new(ProtocolVersion::V1_0).unwrap()
}

/// Responder recording everything it is handed.
#[derive(Default)]
struct RecordingResponder {
    fnf: Mutex<Vec<Payload>>,
    metadata: Mutex<Vec<Bytes>>,
    requests: Mutex<Vec<(Payload, StreamSink)>>,
    stream_requests: Mutex<Vec<(Payload, StreamSink)>>,
}

impl Responder for RecordingResponder {
    fn handle_fire_and_forget(&self, payload: Payload) {
        self.fnf.lock().unwrap().push(payload);
    }

    fn handle_metadata_push(&self, metadata: Bytes) {
        self.metadata.lock().unwrap().push(metadata);
    }

    fn handle_request_response(&self, payload: Payload, sink: StreamSink) {
        self.requests.lock().unwrap().push((payload, sink));
    }

    fn handle_request_stream(&self, payload: Payload, sink: StreamSink) {
        self.stream_requests.lock().unwrap().push((payload, sink));
    }
}

/// Responder answering request/response with its own request payload.
struct EchoResponder;

impl Responder for EchoResponder {
    fn handle_request_response(&self, payload: Payload, sink: StreamSink) {
        sink.payload(payload);
    }
}

struct Peer {
    machine: RSocketStateMachine,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    sink_rx: SinkEventReceiver,
}

impl Peer {
    fn drain_sinks(&mut self) -> usize {
        let mut drained = 0;
        while let Ok((stream_id, event)) = self.sink_rx.try_recv() {
            self.machine.on_sink_event(stream_id, event);
            drained += 1;
        }
        drained
    }

    fn take_outbound(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(bytes) = self.outbound.try_recv() {
            frames.push(bytes);
        }
        frames
    }
}

fn client_peer(responder: Arc<dyn Responder>, params: SetupParameters) -> Peer {
    let (sink_tx, sink_rx) = sink_channel();
    let mut machine = RSocketStateMachine::new(Role::Client, responder, sink_tx);
    let (transport, outbound) = ChannelFrameTransport::new();
    machine.connect_client(transport, params).unwrap();
    Peer {
        machine,
        outbound,
        sink_rx,
    }
}

/// Build a connected pair, playing the acceptor: the client's SETUP frame
/// seeds the server parameters.
fn connected_pair(
    client_responder: Arc<dyn Responder>,
    server_responder: Arc<dyn Responder>,
    params: SetupParameters,
) -> (Peer, Peer) {
    let mut client = client_peer(client_responder, params);

    let setup_bytes = client.outbound.try_recv().unwrap();
    let setup = match serializer().deserialize(setup_bytes).unwrap() {
        Frame::Setup(setup) => setup,
        other => panic!("expected SETUP, got {:?}", other),
    };

    let (sink_tx, sink_rx) = sink_channel();
    let mut machine = RSocketStateMachine::new(Role::Server, server_responder, sink_tx);
    let (transport, outbound) = ChannelFrameTransport::new();
    machine
        .connect_server(transport, SetupParameters::from_frame(setup))
        .unwrap();
    let server = Peer {
        machine,
        outbound,
        sink_rx,
    };
    (client, server)
}

/// Shuttle frames and sink events between the peers until nothing moves.
fn pump(a: &mut Peer, b: &mut Peer) {
    loop {
        let mut moved = a.drain_sinks() + b.drain_sinks();
        while let Ok(bytes) = a.outbound.try_recv() {
            b.machine.process_frame(bytes);
            moved += 1;
        }
        while let Ok(bytes) = b.outbound.try_recv() {
            a.machine.process_frame(bytes);
            moved += 1;
        }
        if moved == 0 {
            break;
        }
    }
}

fn assert_no_error_frames(frames: &[Bytes]) {
    let s = serializer();
    for bytes in frames {
        let frame = s.deserialize(bytes.clone()).unwrap();
        assert!(
            !matches!(frame, Frame::Error(_)),
            "unexpected ERROR frame: {:?}",
            frame
        );
    }
}

// ---------------------------------------------------------------------
// S1: SETUP, fire-and-forget, clean close
// ---------------------------------------------------------------------

#[test]
fn setup_fire_and_forget_and_clean_close() {
    let server_responder = Arc::new(RecordingResponder::default());
    let mut client = client_peer(
        Arc::new(RecordingResponder::default()),
        SetupParameters::default(),
    );

    // SETUP bytes against the v1.0 fixture
    let setup_bytes = client.outbound.try_recv().unwrap();
    let mut expected = Vec::new();
    expected.extend_from_slice(&[0, 0, 0, 0]);
    expected.extend_from_slice(&[0x04, 0x00]);
    expected.extend_from_slice(&[0, 1, 0, 0]);
    expected.extend_from_slice(&30_000u32.to_be_bytes());
    expected.extend_from_slice(&90_000u32.to_be_bytes());
    expected.push(24);
    expected.extend_from_slice(b"application/octet-stream");
    expected.push(24);
    expected.extend_from_slice(b"application/octet-stream");
    assert_eq!(&setup_bytes[..], &expected[..]);

    let (sink_tx, sink_rx) = sink_channel();
    let mut machine =
        RSocketStateMachine::new(Role::Server, server_responder.clone(), sink_tx);
    let (transport, outbound) = ChannelFrameTransport::new();
    let setup = match serializer().deserialize(setup_bytes).unwrap() {
        Frame::Setup(setup) => setup,
        other => panic!("expected SETUP, got {:?}", other),
    };
    machine
        .connect_server(transport, SetupParameters::from_frame(setup))
        .unwrap();
    let mut server = Peer {
        machine,
        outbound,
        sink_rx,
    };

    client
        .machine
        .fire_and_forget(Payload::from_static("hi"))
        .unwrap();

    // fire-and-forget travels on stream 1
    let fnf_bytes = client.outbound.try_recv().unwrap();
    match serializer().deserialize(fnf_bytes.clone()).unwrap() {
        Frame::RequestFnf(fnf) => {
            assert_eq!(fnf.stream_id, 1);
            assert_eq!(&fnf.payload.data[..], b"hi");
        }
        other => panic!("expected REQUEST_FNF, got {:?}", other),
    }
    server.machine.process_frame(fnf_bytes);

    let observed = server_responder.fnf.lock().unwrap();
    assert_eq!(observed.len(), 1);
    assert_eq!(&observed[0].data[..], b"hi");
    drop(observed);

    client.machine.close(
        RSocketError::ConnectionClosed,
        rsocket_core::StreamSignal::ConnectionError,
    );
    assert!(client.machine.is_closed());
    assert_no_error_frames(&client.take_outbound());
    assert_no_error_frames(&server.take_outbound());
}

// ---------------------------------------------------------------------
// S2: request/response happy path
// ---------------------------------------------------------------------

#[test]
fn request_response_happy_path() {
    let server_responder = Arc::new(RecordingResponder::default());
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        server_responder.clone(),
        SetupParameters::default(),
    );

    // burn stream 1 so the request travels on stream 3
    client
        .machine
        .fire_and_forget(Payload::from_static("warmup"))
        .unwrap();

    let payload = Payload::new(Some(Bytes::from_static(b"m")), Bytes::from_static(b"d"));
    let mut reply = client.machine.request_response(payload).unwrap();
    pump(&mut client, &mut server);

    // server observed the request on stream 3 and answers through the sink
    {
        let requests = server_responder.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (request, sink) = &requests[0];
        assert_eq!(sink.stream_id(), 3);
        assert_eq!(request.metadata.as_deref(), Some(&b"m"[..]));
        assert_eq!(&request.data[..], b"d");
        sink.payload(Payload::from_static("answer"));
    }
    pump(&mut client, &mut server);

    let response = reply.try_recv().unwrap().unwrap();
    assert_eq!(&response.data[..], b"answer");

    // stream entries removed on both sides
    assert_eq!(client.machine.stream_count(), 0);
    assert_eq!(server.machine.stream_count(), 0);
}

#[test]
fn request_response_application_error() {
    let server_responder = Arc::new(RecordingResponder::default());
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        server_responder.clone(),
        SetupParameters::default(),
    );

    let mut reply = client
        .machine
        .request_response(Payload::from_static("q"))
        .unwrap();
    pump(&mut client, &mut server);

    server_responder.requests.lock().unwrap()[0]
        .1
        .error("cannot serve");
    pump(&mut client, &mut server);

    match reply.try_recv().unwrap() {
        Err(RSocketError::Stream { code, message }) => {
            assert_eq!(code, ErrorCode::ApplicationError);
            assert_eq!(message, "cannot serve");
        }
        other => panic!("expected stream error, got {:?}", other),
    }
    // the connection survives an application error
    assert_eq!(client.machine.state(), ConnectionState::Connected);
    assert_eq!(server.machine.state(), ConnectionState::Connected);
}

// ---------------------------------------------------------------------
// S3: fragmented initial request, equivalence with the unfragmented path
// ---------------------------------------------------------------------

#[test]
fn fragmented_request_stream_reassembles_byte_identical() {
    let body: Vec<u8> = (0..10_240u32).map(|i| (i % 251) as u8).collect();
    let chunks: Vec<&[u8]> = body.chunks(2_560).collect();
    assert_eq!(chunks.len(), 4);

    let deliver = |frames: Vec<Frame>| -> (Payload, Vec<usize>) {
        let responder = Arc::new(RecordingResponder::default());
        let (_client, mut server) = connected_pair(
            Arc::new(RecordingResponder::default()),
            responder.clone(),
            SetupParameters::default(),
        );
        let s = serializer();
        let mut counts = Vec::new();
        for frame in &frames {
            server.machine.process_frame(s.serialize(frame).unwrap());
            counts.push(server.machine.stream_count());
        }
        let mut requests = responder.stream_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (payload, _sink) = requests.remove(0);
        (payload, counts)
    };

    // fragmented: initial REQUEST_STREAM plus three PAYLOAD continuations
    let fragmented = vec![
        Frame::RequestStream(RequestStreamFrame {
            stream_id: 1,
            follows: true,
            initial_request_n: 32,
            payload: Payload::from_data(Bytes::copy_from_slice(chunks[0])),
        }),
        Frame::Payload(PayloadFrame {
            stream_id: 1,
            follows: true,
            complete: false,
            next: true,
            payload: Payload::from_data(Bytes::copy_from_slice(chunks[1])),
        }),
        Frame::Payload(PayloadFrame {
            stream_id: 1,
            follows: true,
            complete: false,
            next: true,
            payload: Payload::from_data(Bytes::copy_from_slice(chunks[2])),
        }),
        Frame::Payload(PayloadFrame {
            stream_id: 1,
            follows: false,
            complete: false,
            next: true,
            payload: Payload::from_data(Bytes::copy_from_slice(chunks[3])),
        }),
    ];
    let (reassembled, counts) = deliver(fragmented);

    // the stream entry appears only once the last fragment lands
    assert_eq!(counts, vec![0, 0, 0, 1]);
    assert_eq!(&reassembled.data[..], &body[..]);

    // unfragmented path yields the identical request payload
    let whole = vec![Frame::RequestStream(RequestStreamFrame {
        stream_id: 1,
        follows: false,
        initial_request_n: 32,
        payload: Payload::from_data(Bytes::from(body.clone())),
    })];
    let (direct, _) = deliver(whole);
    assert_eq!(direct, reassembled);
}

// ---------------------------------------------------------------------
// S4: resume success
// ---------------------------------------------------------------------

#[test]
fn resume_replays_undelivered_frames_and_keeps_streams_live() {
    let server_responder = Arc::new(RecordingResponder::default());
    let token = ResumeToken::generate();
    let params = SetupParameters {
        token: Some(token.clone()),
        ..SetupParameters::default()
    };
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        server_responder.clone(),
        params,
    );

    // a live subscription from the client
    let mut events = client
        .machine
        .request_stream(Payload::from_static("subscribe"))
        .unwrap();
    pump(&mut client, &mut server);

    // first element is delivered before the outage
    server_responder.stream_requests.lock().unwrap()[0]
        .1
        .payload(Payload::from_static("one"));
    pump(&mut client, &mut server);
    match events.try_recv().unwrap() {
        StreamEvent::Payload(payload) => assert_eq!(&payload.data[..], b"one"),
        other => panic!("unexpected event {:?}", other),
    }

    // the transport dies; the second element is written into the void
    client.machine.disconnect(RSocketError::ConnectionClosed);
    assert_eq!(client.machine.state(), ConnectionState::Disconnected);
    server_responder.stream_requests.lock().unwrap()[0]
        .1
        .payload(Payload::from_static("two"));
    server.drain_sinks();
    let lost = server.take_outbound();
    assert_eq!(lost.len(), 1);

    // client reconnects on a fresh transport
    let (new_client_transport, mut client_outbound) = ChannelFrameTransport::new();
    let (callback, mut verdict) = tokio::sync::oneshot::channel();
    client
        .machine
        .resume_client(token, new_client_transport, callback, ProtocolVersion::V1_0)
        .unwrap();
    assert_eq!(client.machine.state(), ConnectionState::Resuming);

    // the acceptor routes the RESUME to the retained server machine
    let resume_bytes = client_outbound.try_recv().unwrap();
    let resume = match serializer().deserialize(resume_bytes).unwrap() {
        Frame::Resume(resume) => resume,
        other => panic!("expected RESUME, got {:?}", other),
    };
    let (new_server_transport, server_outbound) = ChannelFrameTransport::new();
    let accepted = server.machine.resume_server(
        new_server_transport,
        ResumeParameters::from_frame(resume),
    );
    assert!(accepted);
    server.outbound = server_outbound;
    client.outbound = client_outbound;

    pump(&mut client, &mut server);
    assert_eq!(client.machine.state(), ConnectionState::Connected);
    assert!(verdict.try_recv().unwrap().is_ok());

    // the lost element arrived exactly once, on the still-live stream
    match events.try_recv().unwrap() {
        StreamEvent::Payload(payload) => assert_eq!(&payload.data[..], b"two"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(events.try_recv().is_err());
    assert_eq!(client.machine.stream_count(), 1);
    assert_eq!(server.machine.stream_count(), 1);

    // and the stream keeps flowing after resumption
    server_responder.stream_requests.lock().unwrap()[0]
        .1
        .payload(Payload::from_static("three"));
    pump(&mut client, &mut server);
    match events.try_recv().unwrap() {
        StreamEvent::Payload(payload) => assert_eq!(&payload.data[..], b"three"),
        other => panic!("unexpected event {:?}", other),
    }
}

// ---------------------------------------------------------------------
// S5: resume rejected
// ---------------------------------------------------------------------

#[test]
fn resume_from_evicted_position_is_rejected() {
    let server_responder = Arc::new(RecordingResponder::default());
    let token = ResumeToken::generate();
    let params = SetupParameters {
        token: Some(token.clone()),
        ..SetupParameters::default()
    };
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        server_responder.clone(),
        params,
    );

    // swap in a tiny server-side cache so early frames get evicted
    let (sink_tx, sink_rx) = sink_channel();
    let mut machine = RSocketStateMachine::new(
        Role::Server,
        server_responder.clone(),
        sink_tx,
    )
    .with_resume_manager(Box::new(
        rsocket_core::resume::InMemoryResumeManager::with_capacity(64),
    ));
    let (transport, outbound) = ChannelFrameTransport::new();
    machine
        .connect_server(
            transport,
            SetupParameters {
                token: Some(token.clone()),
                ..SetupParameters::default()
            },
        )
        .unwrap();
    server = Peer {
        machine,
        outbound,
        sink_rx,
    };

    // the server emits enough undelivered frames to overflow its cache
    let mut reply = client
        .machine
        .request_stream(Payload::from_static("subscribe"))
        .unwrap();
    pump(&mut client, &mut server);
    for _ in 0..8 {
        server_responder.stream_requests.lock().unwrap()[0]
            .1
            .payload(Payload::from_static("element-that-was-never-delivered"));
    }
    server.drain_sinks();
    let _lost = server.take_outbound();

    // client still believes the server position is 0, which is evicted
    client.machine.disconnect(RSocketError::ConnectionClosed);
    let (new_client_transport, mut client_outbound) = ChannelFrameTransport::new();
    let (callback, mut verdict) = tokio::sync::oneshot::channel();
    client
        .machine
        .resume_client(token, new_client_transport, callback, ProtocolVersion::V1_0)
        .unwrap();

    let resume = match serializer()
        .deserialize(client_outbound.try_recv().unwrap())
        .unwrap()
    {
        Frame::Resume(resume) => resume,
        other => panic!("expected RESUME, got {:?}", other),
    };
    let (new_server_transport, mut server_outbound) = ChannelFrameTransport::new();
    let accepted = server.machine.resume_server(
        new_server_transport,
        ResumeParameters::from_frame(resume),
    );
    assert!(!accepted);
    assert!(server.machine.is_closed());

    // REJECTED_RESUME reaches the client, which closes for good
    let error_bytes = server_outbound.try_recv().unwrap();
    match serializer().deserialize(error_bytes.clone()).unwrap() {
        Frame::Error(error) => assert_eq!(error.code, ErrorCode::RejectedResume),
        other => panic!("expected ERROR, got {:?}", other),
    }
    client.machine.process_frame(error_bytes);
    assert_eq!(client.machine.state(), ConnectionState::Closed);
    assert!(verdict.try_recv().unwrap().is_err());
    drop(reply.try_recv());
}

// ---------------------------------------------------------------------
// S6: keepalive timeout
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn keepalive_timeout_closes_both_ends() {
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        Arc::new(RecordingResponder::default()),
        SetupParameters::default(),
    );

    // server goes silent past the max lifetime
    tokio::time::advance(std::time::Duration::from_millis(90_001)).await;
    client.machine.on_keepalive_tick(tokio::time::Instant::now());
    assert!(client.machine.is_closed());

    // the terminal ERROR is the client's last word
    let outbound = client.take_outbound();
    let last = serializer()
        .deserialize(outbound.last().unwrap().clone())
        .unwrap();
    match last {
        Frame::Error(error) => assert_eq!(error.code, ErrorCode::ConnectionError),
        other => panic!("expected ERROR, got {:?}", other),
    }

    // no further frames once closed
    tokio::time::advance(std::time::Duration::from_secs(60)).await;
    client.machine.on_keepalive_tick(tokio::time::Instant::now());
    assert!(client.take_outbound().is_empty());

    server.machine.process_frame(
        serializer()
            .serialize(&Frame::Error(
                rsocket_core::frame::ErrorFrame::connection_error("keepalive timeout"),
            ))
            .unwrap(),
    );
    assert!(server.machine.is_closed());
}

// ---------------------------------------------------------------------
// Cross-cutting properties
// ---------------------------------------------------------------------

#[test]
fn stream_ids_keep_role_parity_in_both_directions() {
    let server_responder = Arc::new(RecordingResponder::default());
    let client_responder = Arc::new(RecordingResponder::default());
    let (mut client, mut server) = connected_pair(
        client_responder.clone(),
        server_responder.clone(),
        SetupParameters::default(),
    );

    client
        .machine
        .fire_and_forget(Payload::from_static("a"))
        .unwrap();
    let _r1 = client
        .machine
        .request_response(Payload::from_static("b"))
        .unwrap();
    server
        .machine
        .fire_and_forget(Payload::from_static("c"))
        .unwrap();
    let _r2 = server
        .machine
        .request_response(Payload::from_static("d"))
        .unwrap();

    let s = serializer();
    for bytes in client.take_outbound() {
        let frame = s.deserialize(bytes).unwrap();
        assert_eq!(frame.stream_id() % 2, 1, "client ids must be odd");
    }
    for bytes in server.take_outbound() {
        let frame = s.deserialize(bytes).unwrap();
        assert_eq!(frame.stream_id() % 2, 0, "server ids must be even");
    }
}

#[test]
fn channel_carries_elements_both_ways() {
    let server_responder = Arc::new(ChannelUppercaseResponder::default());
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        server_responder.clone(),
        SetupParameters::default(),
    );

    let (writer, mut events) = client
        .machine
        .request_channel(Payload::from_static("start"))
        .unwrap();
    pump(&mut client, &mut server);

    writer.payload(Payload::from_static("abc"));
    writer.payload(Payload::from_static("xyz"));
    writer.complete();
    pump(&mut client, &mut server);

    // the responder's task drained the inbound side and echoed uppercase
    server_responder.respond_all();
    pump(&mut client, &mut server);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            StreamEvent::Payload(payload) => {
                received.push(String::from_utf8(payload.data.to_vec()).unwrap())
            }
            StreamEvent::Complete => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(received, vec!["ABC".to_string(), "XYZ".to_string()]);
    assert_eq!(client.machine.stream_count(), 0);
    assert_eq!(server.machine.stream_count(), 0);
}

/// Channel responder buffering inbound elements to echo them uppercased.
#[derive(Default)]
struct ChannelUppercaseResponder {
    channels: Mutex<Vec<(mpsc::UnboundedReceiver<StreamEvent>, StreamSink)>>,
}

impl ChannelUppercaseResponder {
    fn respond_all(&self) {
        let mut channels = self.channels.lock().unwrap();
        for (inbound, sink) in channels.iter_mut() {
            while let Ok(event) = inbound.try_recv() {
                match event {
                    StreamEvent::Payload(payload) => {
                        let upper = payload.data.to_ascii_uppercase();
                        sink.payload(Payload::from_data(Bytes::from(upper)));
                    }
                    StreamEvent::Complete => sink.complete(),
                    StreamEvent::Error(_) => sink.error("channel failed"),
                }
            }
        }
    }
}

impl Responder for ChannelUppercaseResponder {
    fn handle_request_channel(
        &self,
        _payload: Payload,
        inbound: mpsc::UnboundedReceiver<StreamEvent>,
        sink: StreamSink,
    ) {
        self.channels.lock().unwrap().push((inbound, sink));
    }
}

#[test]
fn metadata_push_reaches_the_responder() {
    let server_responder = Arc::new(RecordingResponder::default());
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        server_responder.clone(),
        SetupParameters::default(),
    );

    client
        .machine
        .metadata_push(Bytes::from_static(b"routing-info"))
        .unwrap();
    pump(&mut client, &mut server);

    let observed = server_responder.metadata.lock().unwrap();
    assert_eq!(observed.len(), 1);
    assert_eq!(&observed[0][..], b"routing-info");
}

#[test]
fn structured_payloads_roundtrip_through_request_response() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Query {
        id: u32,
        term: String,
    }

    let params = SetupParameters {
        data_mime_type: MIME_MSGPACK.to_string(),
        ..SetupParameters::default()
    };
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        Arc::new(EchoResponder),
        params,
    );

    let query = Query {
        id: 9,
        term: "frames".to_string(),
    };
    let encoded = MsgPackCodec::encode(&query).unwrap();
    let mut reply = client
        .machine
        .request_response(Payload::from_data(Bytes::from(encoded)))
        .unwrap();
    pump(&mut client, &mut server);

    let response = reply.try_recv().unwrap().unwrap();
    let decoded: Query = MsgPackCodec::decode(&response.data).unwrap();
    assert_eq!(decoded, query);
}

#[test]
fn protocol_violations_are_logged_at_warn() {
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    let capture = CaptureWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut client = client_peer(
            Arc::new(RecordingResponder::default()),
            SetupParameters::default(),
        );
        // undecodable frame: unknown type code
        client
            .machine
            .process_frame(Bytes::from_static(&[0, 0, 0, 1, 0x40, 0]));
        assert!(client.machine.is_closed());
    });

    let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    assert!(
        logs.contains("closing connection with error"),
        "missing warn line in: {}",
        logs
    );
    assert!(logs.contains("CONNECTION_ERROR"));
}

#[test]
fn cancel_tears_down_the_responder_stream() {
    let server_responder = Arc::new(RecordingResponder::default());
    let (mut client, mut server) = connected_pair(
        Arc::new(RecordingResponder::default()),
        server_responder.clone(),
        SetupParameters::default(),
    );

    let _events = client
        .machine
        .request_stream(Payload::from_static("subscribe"))
        .unwrap();
    pump(&mut client, &mut server);
    assert_eq!(server.machine.stream_count(), 1);

    client.machine.cancel_stream(1).unwrap();
    pump(&mut client, &mut server);

    assert_eq!(client.machine.stream_count(), 0);
    assert_eq!(server.machine.stream_count(), 0);

    // late elements from the responder are dropped, not fatal
    server_responder.stream_requests.lock().unwrap()[0]
        .1
        .payload(Payload::from_static("late"));
    pump(&mut client, &mut server);
    assert_eq!(client.machine.state(), ConnectionState::Connected);
    assert_eq!(server.machine.state(), ConnectionState::Connected);
}
