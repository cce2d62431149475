//! Channel health: last-activity tracking and the silence thresholds.
//!
//! Healthy means the transport reports open and the peer has been heard
//! from within 1.5x the keepalive interval. A coarser 2x threshold is the
//! maintenance sweep's redundant safety net.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Shared between the manager task (writer) and client handles (readers),
/// so `is_healthy()` never has to round-trip through the command channel.
#[derive(Debug)]
pub(crate) struct HealthProbe {
    keepalive_interval: Duration,
    open: AtomicBool,
    /// Any inbound frame refreshes this.
    last_activity: Mutex<Instant>,
    /// Only keepalive responses refresh this.
    last_keepalive: Mutex<Instant>,
}

impl HealthProbe {
    pub(crate) fn new(keepalive_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            keepalive_interval,
            open: AtomicBool::new(false),
            last_activity: Mutex::new(now),
            last_keepalive: Mutex::new(now),
        }
    }

    /// Transport opened: reset both timestamps to now.
    pub(crate) fn mark_open(&self) {
        let now = Instant::now();
        *self.last_activity.lock() = now;
        *self.last_keepalive.lock() = now;
        self.open.store(true, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub(crate) fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn touch_keepalive(&self) {
        let now = Instant::now();
        *self.last_activity.lock() = now;
        *self.last_keepalive.lock() = now;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Time since the peer was last heard from.
    pub(crate) fn silence(&self) -> Duration {
        self.silence_at(Instant::now())
    }

    fn silence_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy_at(Instant::now())
    }

    /// Open and silence below 1.5x the keepalive interval.
    pub(crate) fn healthy_at(&self, now: Instant) -> bool {
        self.is_open() && self.silence_at(now) < self.healthy_bound()
    }

    /// Silence past 2x the keepalive interval: the maintenance sweep's
    /// heartbeat-timeout condition.
    pub(crate) fn silent_past_cutoff(&self) -> bool {
        self.silence() > self.keepalive_interval * 2
    }

    fn healthy_bound(&self) -> Duration {
        self.keepalive_interval + self.keepalive_interval / 2
    }
}
