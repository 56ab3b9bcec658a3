#![expect(
    clippy::module_name_repetitions,
    reason = "Type names carry their role when re-exported from the ws module"
)]

//! Liveness bookkeeping for an open transport.

use std::time::Duration;

use tokio::time::Instant;

/// Result of a liveness check.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// A pong or heartbeat arrived recently enough, or no timeout applies
    Alive,
    /// Nothing proved the server alive for longer than the timeout
    Expired { silent_for: Duration },
}

/// Tracks when the server last proved it was alive.
///
/// The monitor only measures; sending pings and acting on [`Liveness::Expired`]
/// is up to the connection driver.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    opened_at: Option<Instant>,
    last_pong: Option<Instant>,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin monitoring a freshly opened transport. Silence is measured from
    /// `now` until the first pong on the new transport.
    pub fn start(&mut self, now: Instant) {
        self.opened_at = Some(now);
    }

    pub fn stop(&mut self) {
        self.opened_at = None;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.opened_at.is_some()
    }

    /// A `pong` or `heartbeat` arrived.
    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong = Some(now);
    }

    /// When the most recent `pong` or `heartbeat` arrived.
    #[must_use]
    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    /// Compare the time since the last sign of life (or since the transport
    /// opened) against `timeout`. A stopped monitor is always alive.
    #[must_use]
    pub fn check(&self, timeout: Option<Duration>, now: Instant) -> Liveness {
        let (Some(timeout), Some(opened_at)) = (timeout, self.opened_at) else {
            return Liveness::Alive;
        };

        let reference = self.last_pong.map_or(opened_at, |pong| pong.max(opened_at));
        let silent_for = now.saturating_duration_since(reference);
        if silent_for > timeout {
            Liveness::Expired { silent_for }
        } else {
            Liveness::Alive
        }
    }
}
