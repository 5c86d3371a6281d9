//! Keep-alive timer.
//!
//! A PINGREQ is due once nothing has been sent for a full interval. After
//! that the broker has one more interval to answer with PINGRESP before the
//! connection is considered lost.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Option<Duration>,
    last_sent: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    /// Zero seconds disables keep-alive.
    pub fn new(keep_alive_secs: u16, now: Instant) -> Self {
        let interval = (keep_alive_secs > 0).then(|| Duration::from_secs(u64::from(keep_alive_secs)));
        Self::with_interval(interval, now)
    }

    pub fn with_interval(interval: Option<Duration>, now: Instant) -> Self {
        Self {
            interval,
            last_sent: now,
            ping_sent_at: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn awaiting_pingresp(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    pub fn on_packet_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.ping_sent_at = Some(now);
    }

    pub fn on_pingresp(&mut self) {
        self.ping_sent_at = None;
    }

    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        match self.next_deadline() {
            Some(deadline) if now >= deadline => {
                if self.ping_sent_at.is_some() {
                    KeepAliveAction::TimedOut
                } else {
                    KeepAliveAction::SendPing
                }
            }
            _ => KeepAliveAction::Idle,
        }
    }

    /// When [`poll`](Self::poll) next has something to report.
    pub fn next_deadline(&self) -> Option<Instant> {
        let interval = self.interval?;
        Some(self.ping_sent_at.unwrap_or(self.last_sent) + interval)
    }
}
