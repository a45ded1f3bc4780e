//! Dedicated writer task for stream transports.
//!
//! Frames reach the wire through a channel consumed by one writer task,
//! which prepends length prefixes and batches multiple frames into single
//! syscalls via vectored writes:
//!
//! ```text
//! state machine ─► DuplexFrameTransport ─► mpsc ─► writer task ─► socket
//! ```
//!
//! The channel keeps [`FrameTransport::send`] synchronous and lock-free for
//! the state machine while the task absorbs socket latency.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{RSocketError, Result};

use super::framing::{length_prefix, LENGTH_PREFIX_SIZE};
use super::FrameTransport;

/// Maximum frames to batch in a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written, prefix pre-encoded.
#[derive(Debug)]
struct OutboundFrame {
    prefix: [u8; LENGTH_PREFIX_SIZE],
    frame: Bytes,
}

impl OutboundFrame {
    fn new(frame: Bytes) -> Result<Self> {
        Ok(Self {
            prefix: length_prefix(&frame)?,
            frame,
        })
    }

    fn size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.frame.len()
    }
}

enum WriterMessage {
    Frame(OutboundFrame),
    Shutdown,
}

/// [`FrameTransport`] over the write half of any `AsyncWrite` stream.
///
/// Cheap to share behind an `Arc`; sends never block the caller.
pub struct DuplexFrameTransport {
    tx: mpsc::UnboundedSender<WriterMessage>,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl DuplexFrameTransport {
    /// Frames accepted but not yet written by the writer task.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl FrameTransport for DuplexFrameTransport {
    fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RSocketError::ConnectionClosed);
        }
        let outbound = OutboundFrame::new(frame)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx
            .send(WriterMessage::Frame(outbound))
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::Release);
                RSocketError::ConnectionClosed
            })
    }

    fn close(&self, cause: Option<String>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(cause) = cause {
                tracing::debug!(%cause, "duplex transport closed");
            }
            let _ = self.tx.send(WriterMessage::Shutdown);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Spawn the writer task over a write half.
///
/// Returns the transport and a join handle resolving when the writer shuts
/// down (transport closed or sink error).
pub fn spawn_writer_task<W>(writer: W) -> (Arc<DuplexFrameTransport>, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let transport = Arc::new(DuplexFrameTransport {
        tx,
        pending: pending.clone(),
        closed: AtomicBool::new(false),
    });

    let task = tokio::spawn(writer_loop(rx, writer, pending));
    (transport, task)
}

/// Main writer loop: batch ready frames and write them out.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(WriterMessage::Frame(frame)) => frame,
            Some(WriterMessage::Shutdown) | None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        let mut shutdown = false;

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(WriterMessage::Frame(frame)) => batch.push(frame),
                Ok(WriterMessage::Shutdown) => {
                    shutdown = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;
        pending.fetch_sub(batch_size, Ordering::Release);

        if shutdown {
            let _ = writer.shutdown().await;
            return Ok(());
        }
    }
}

/// Write a batch with scatter/gather I/O, continuing across partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0usize;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RSocketError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlice array for data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0usize;

    for frame in batch {
        let prefix_end = skipped + LENGTH_PREFIX_SIZE;
        if skip_bytes < prefix_end {
            let start = skip_bytes.saturating_sub(skipped);
            slices.push(IoSlice::new(&frame.prefix[start..]));
        }
        skipped = prefix_end;

        let frame_end = skipped + frame.frame.len();
        if !frame.frame.is_empty() && skip_bytes < frame_end {
            let start = skip_bytes.saturating_sub(skipped);
            slices.push(IoSlice::new(&frame.frame[start..]));
        }
        skipped = frame_end;
    }

    slices
}
