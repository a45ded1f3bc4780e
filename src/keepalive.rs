//! Keepalive bookkeeping.
//!
//! The timer itself is a plain data structure: the connection driver owns
//! the periodic tick (a tokio interval) and asks the [`KeepaliveTimer`]
//! what the tick means. Inbound activity of any kind counts as liveness;
//! a connection is dead once `max_lifetime` passes without it.

use std::time::Duration;

use tokio::time::Instant;

/// Liveness bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct KeepaliveTimer {
    interval: Duration,
    max_lifetime: Duration,
    last_activity: Instant,
}

impl KeepaliveTimer {
    /// Create a timer; `now` seeds the activity clock.
    pub fn new(interval: Duration, max_lifetime: Duration, now: Instant) -> Self {
        Self {
            interval,
            max_lifetime,
            last_activity: now,
        }
    }

    /// Interval at which KEEPALIVE frames should be emitted.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time without inbound activity after which the connection is dead.
    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// Record inbound activity.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether `max_lifetime` has elapsed since the last inbound activity.
    pub fn is_dead(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.max_lifetime
    }

    /// Time since the last inbound activity.
    pub fn time_since_activity(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}
