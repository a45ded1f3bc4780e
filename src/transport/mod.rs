//! Transport seam: ordered, reliable delivery of complete frame buffers.
//!
//! The connection state machine talks to the wire exclusively through
//! [`FrameTransport`]: one complete frame buffer (without length prefix)
//! per call in each direction. The socket-level byte plumbing lives behind
//! this trait: [`writer::DuplexFrameTransport`] for any
//! `AsyncWrite` half, [`ChannelFrameTransport`] for in-process wiring and
//! tests.

pub mod framing;
pub mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{RSocketError, Result};

pub use framing::{FrameBuffer, LENGTH_PREFIX_SIZE, MAX_FRAME_LENGTH};
pub use writer::{spawn_writer_task, DuplexFrameTransport};

/// Ordered, reliable, byte-framed duplex channel, downward half.
///
/// Implementations accept one complete frame buffer per [`send`] call and
/// must preserve call order. [`close`] releases the underlying channel and
/// is idempotent; the cause is informational.
///
/// [`send`]: FrameTransport::send
/// [`close`]: FrameTransport::close
pub trait FrameTransport: Send + Sync {
    /// Queue one complete frame (without length prefix) for transmission.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Close the underlying channel. Idempotent.
    fn close(&self, cause: Option<String>);

    /// Whether the transport has been closed.
    fn is_closed(&self) -> bool;
}

/// In-process transport delivering frames over an unbounded channel.
///
/// The receiving half is handed back to the caller; feeding it into a peer
/// state machine yields a fully in-memory connection, which is how the
/// protocol scenarios are tested.
pub struct ChannelFrameTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
}

impl ChannelFrameTransport {
    /// Create a transport and the receiver observing its outbound frames.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

impl FrameTransport for ChannelFrameTransport {
    fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RSocketError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .map_err(|_| RSocketError::ConnectionClosed)
    }

    fn close(&self, cause: Option<String>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(cause) = cause {
                tracing::debug!(%cause, "channel transport closed");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
