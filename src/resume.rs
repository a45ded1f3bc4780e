//! Resumption state: positioned frame cache and receive-position tracking.
//!
//! Positions are monotonically increasing byte counts of resumable frames
//! sent in one direction, counted over serialized frames without the
//! transport length prefix. The manager keeps an append-only ring of
//! `(position, frame)` pairs between a low-water mark (oldest retained
//! position) and a high-water mark (next position to be assigned), trims
//! the tail as the peer acknowledges positions, and separately tracks the
//! position implied by received resumable frames.
//!
//! Storage is pluggable behind the [`ResumeManager`] trait; the in-memory
//! implementation suits warm resumption within one process.

use std::collections::VecDeque;

use bytes::Bytes;

/// Absolute resume position (63-bit on the wire).
pub type ResumePosition = u64;

/// Default retention budget for the in-memory frame cache.
pub const DEFAULT_CACHE_CAPACITY_BYTES: usize = 2 * 1024 * 1024;

/// State needed for warm/cold resumption of one connection.
pub trait ResumeManager: Send {
    /// Record an outbound resumable frame; advances the high-water mark by
    /// the frame length.
    fn track_sent_frame(&mut self, frame: Bytes);

    /// Record an inbound resumable frame of the given length.
    fn track_received_frame(&mut self, frame_len: usize);

    /// Release cached frames entirely below `position` — the peer has
    /// acknowledged receiving them.
    fn release_frames(&mut self, position: ResumePosition);

    /// Whether replay can start exactly at `position`: within the retained
    /// window and on a frame boundary.
    fn is_position_available(&self, position: ResumePosition) -> bool;

    /// Cached frames with absolute position `>= position`, in send order.
    fn frames_from_position(&self, position: ResumePosition) -> Vec<Bytes>;

    /// Low-water mark: oldest position still retained.
    fn first_sent_position(&self) -> ResumePosition;

    /// High-water mark: position the next sent frame will get.
    fn last_sent_position(&self) -> ResumePosition;

    /// Position implied by the resumable frames received so far.
    fn last_received_position(&self) -> ResumePosition;
}

/// In-memory ring of positioned frames, bounded in bytes.
pub struct InMemoryResumeManager {
    frames: VecDeque<(ResumePosition, Bytes)>,
    first_available: ResumePosition,
    next_position: ResumePosition,
    last_received: ResumePosition,
    capacity_bytes: usize,
    buffered_bytes: usize,
}

impl InMemoryResumeManager {
    /// Create a manager with the default retention budget.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY_BYTES)
    }

    /// Create a manager retaining at most `capacity_bytes` of frames.
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            first_available: 0,
            next_position: 0,
            last_received: 0,
            capacity_bytes,
            buffered_bytes: 0,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((position, frame)) = self.frames.pop_front() {
            self.buffered_bytes -= frame.len();
            self.first_available = position + frame.len() as u64;
        }
    }
}

impl Default for InMemoryResumeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumeManager for InMemoryResumeManager {
    fn track_sent_frame(&mut self, frame: Bytes) {
        let len = frame.len();
        self.frames.push_back((self.next_position, frame));
        self.next_position += len as u64;
        self.buffered_bytes += len;

        while self.buffered_bytes > self.capacity_bytes && !self.frames.is_empty() {
            self.evict_oldest();
        }
    }

    fn track_received_frame(&mut self, frame_len: usize) {
        self.last_received += frame_len as u64;
    }

    fn release_frames(&mut self, position: ResumePosition) {
        while let Some((front_position, front_frame)) = self.frames.front() {
            if front_position + front_frame.len() as u64 <= position {
                self.evict_oldest();
            } else {
                break;
            }
        }
        if self.frames.is_empty() {
            self.first_available = self.first_available.max(position.min(self.next_position));
        }
    }

    fn is_position_available(&self, position: ResumePosition) -> bool {
        if position < self.first_available || position > self.next_position {
            return false;
        }
        position == self.next_position
            || self.frames.iter().any(|(p, _)| *p == position)
    }

    fn frames_from_position(&self, position: ResumePosition) -> Vec<Bytes> {
        self.frames
            .iter()
            .filter(|(p, _)| *p >= position)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    fn first_sent_position(&self) -> ResumePosition {
        self.first_available
    }

    fn last_sent_position(&self) -> ResumePosition {
        self.next_position
    }

    fn last_received_position(&self) -> ResumePosition {
        self.last_received
    }
}
