//! # rsocket-core
//!
//! Bidirectional, asymmetric, multiplexed RSocket protocol engine.
//!
//! The crate owns a single transport connection and demultiplexes frames
//! into per-stream state machines across the four interaction patterns
//! (fire-and-forget, request/response, request/stream, request/channel),
//! implementing the connection-level contract: SETUP handshake, KEEPALIVE
//! liveness, fragmentation reassembly for initial requests, ERROR and
//! cancellation propagation, and warm resumption across transports.
//!
//! ## Architecture
//!
//! - **Core**: [`connection::RSocketStateMachine`] is a synchronous state
//!   machine; one logical executor feeds it frame buffers, sink events and
//!   keepalive ticks, and it writes frames through a
//!   [`transport::FrameTransport`].
//! - **Driver**: [`driver::connect`] / [`driver::accept`] wire the core to
//!   any `AsyncRead + AsyncWrite` byte stream with a dedicated writer task
//!   and a driver task as the executor.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rsocket_core::{connect, Payload, Responder, SetupParameters, StreamSink};
//!
//! struct Echo;
//!
//! impl Responder for Echo {
//!     fn handle_request_response(&self, payload: Payload, sink: StreamSink) {
//!         sink.payload(payload);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = tokio::net::TcpStream::connect("127.0.0.1:7878").await?;
//!     let connection = connect(socket, SetupParameters::default(), Arc::new(Echo)).await?;
//!
//!     let response = connection
//!         .handle()
//!         .request_response(Payload::from_static("ping"))
//!         .await?;
//!     println!("{:?}", response.data);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod driver;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod responder;
pub mod resume;
pub mod setup;
pub mod stream;
pub mod transport;

pub use connection::{ConnectionEvents, ConnectionState, RSocketStateMachine};
pub use driver::{accept, connect, ConnectionHandle, RSocketConnection};
pub use error::{ErrorCode, RSocketError, Result};
pub use frame::{Frame, FrameSerializer, Payload, StreamId};
pub use responder::{RejectingResponder, Responder};
pub use resume::{InMemoryResumeManager, ResumeManager, ResumePosition};
pub use setup::{ProtocolVersion, ResumeParameters, ResumeToken, SetupParameters};
pub use stream::{Role, StreamEvent, StreamSignal, StreamSink};
pub use transport::FrameTransport;
