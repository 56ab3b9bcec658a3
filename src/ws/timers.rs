//! Every timer the connection driver owns, in one place so a single call can
//! cancel them all.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};

/// A timer that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// The in-flight handshake took longer than the connection timeout
    ConnectDeadline,
    /// The backoff delay elapsed; time for the next connection attempt
    Reconnect,
    /// Time to ping and check liveness
    Heartbeat,
    /// Time to transmit the next queued batch
    Flush,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    connect_deadline: Option<Pin<Box<Sleep>>>,
    reconnect: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    flush: Option<Interval>,
}

impl Timers {
    pub(crate) fn arm_connect_deadline(&mut self, timeout: Duration) {
        self.connect_deadline = Some(Box::pin(sleep(timeout)));
    }

    pub(crate) fn cancel_connect_deadline(&mut self) {
        self.connect_deadline = None;
    }

    pub(crate) fn arm_reconnect(&mut self, delay: Duration) {
        self.reconnect = Some(Box::pin(sleep(delay)));
    }

    pub(crate) fn cancel_reconnect(&mut self) {
        self.reconnect = None;
    }

    pub(crate) fn reconnect_scheduled(&self) -> bool {
        self.reconnect.is_some()
    }

    /// Tick every `period`, starting one period from now.
    pub(crate) fn start_heartbeat(&mut self, period: Duration) {
        self.heartbeat = Some(periodic(period));
    }

    pub(crate) fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
    }

    /// Start the flush ticker unless it is already running.
    pub(crate) fn ensure_flush(&mut self, period: Duration) {
        if self.flush.is_none() {
            self.flush = Some(periodic(period));
        }
    }

    pub(crate) fn stop_flush(&mut self) {
        self.flush = None;
    }

    pub(crate) fn flush_running(&self) -> bool {
        self.flush.is_some()
    }

    /// Cancel everything.
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.connect_deadline.is_none()
            && self.reconnect.is_none()
            && self.heartbeat.is_none()
            && self.flush.is_none()
    }

    /// Wait for the next armed timer. Never resolves while all are idle.
    ///
    /// One-shot timers disarm themselves when they fire.
    pub(crate) async fn next(&mut self) -> TimerEvent {
        let event = tokio::select! {
            () = fire_once(&mut self.connect_deadline) => TimerEvent::ConnectDeadline,
            () = fire_once(&mut self.reconnect) => TimerEvent::Reconnect,
            () = tick(&mut self.heartbeat) => TimerEvent::Heartbeat,
            () = tick(&mut self.flush) => TimerEvent::Flush,
        };

        match event {
            TimerEvent::ConnectDeadline => self.connect_deadline = None,
            TimerEvent::Reconnect => self.reconnect = None,
            TimerEvent::Heartbeat | TimerEvent::Flush => {}
        }
        event
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn fire_once(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(deadline) => deadline.as_mut().await,
        None => pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reconnect_fires_once_then_disarms() {
        let mut timers = Timers::default();
        timers.arm_reconnect(Duration::from_secs(2));

        assert_eq!(timers.next().await, TimerEvent::Reconnect);
        assert!(!timers.reconnect_scheduled());
        assert!(timers.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_timer_wins() {
        let mut timers = Timers::default();
        timers.arm_reconnect(Duration::from_secs(5));
        timers.arm_connect_deadline(Duration::from_secs(1));

        assert_eq!(timers.next().await, TimerEvent::ConnectDeadline);
        assert_eq!(timers.next().await, TimerEvent::Reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timers_do_not_fire_immediately() {
        let mut timers = Timers::default();
        timers.start_heartbeat(Duration::from_secs(30));

        let early = timeout(Duration::from_secs(29), timers.next()).await;
        assert!(early.is_err());
        assert_eq!(timers.next().await, TimerEvent::Heartbeat);
        assert_eq!(timers.next().await, TimerEvent::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_after_clear() {
        let mut timers = Timers::default();
        timers.arm_connect_deadline(Duration::from_secs(1));
        timers.arm_reconnect(Duration::from_secs(1));
        timers.start_heartbeat(Duration::from_secs(1));
        timers.ensure_flush(Duration::from_secs(1));

        timers.clear();

        assert!(timers.is_idle());
        let fired = timeout(Duration::from_secs(3600), timers.next()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_flush_keeps_running_interval() {
        let mut timers = Timers::default();
        timers.ensure_flush(Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(600)).await;
        timers.ensure_flush(Duration::from_secs(1));

        let fired = timeout(Duration::from_millis(500), timers.next()).await;
        assert_eq!(fired.ok(), Some(TimerEvent::Flush));
        assert!(timers.flush_running());
    }
}
