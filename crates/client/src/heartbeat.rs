//! Ping/pong liveness bookkeeping for one open socket.
//!
//! [`Heartbeat`] holds no timers of its own; the session loop asks it for the
//! next deadline and reports what happened. Only one ping is ever
//! outstanding: while a pong is awaited the ping timer is suspended.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    next_ping: Instant,
    awaiting: Option<Instant>,
}

impl Heartbeat {
    /// Start the schedule; the first ping is due one interval after `now`.
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            next_ping: now + interval,
            awaiting: None,
        }
    }

    /// A zero interval turns the heartbeat off.
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// When the next ping should go out.
    pub fn next_ping(&self) -> Instant {
        self.next_ping
    }

    /// Deadline for the outstanding pong, if one is awaited.
    pub fn pong_deadline(&self) -> Option<Instant> {
        self.awaiting.map(|sent_at| sent_at + self.timeout)
    }

    pub fn awaiting_pong(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Record that a ping was written at `now`.
    pub fn ping_sent(&mut self, now: Instant) {
        self.awaiting = Some(now);
        self.next_ping = now + self.interval;
    }

    /// Record a pong. Returns the round-trip time when a ping was
    /// outstanding; an unsolicited pong is ignored.
    pub fn pong_received(&mut self, now: Instant) -> Option<Duration> {
        let sent_at = self.awaiting.take()?;
        Some(now.saturating_duration_since(sent_at))
    }
}
