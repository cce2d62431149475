//! Connection-quality metrics and the error counters that trip forced
//! reconnects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Smoothing factor for the latency exponential moving average.
const EMA_ALPHA: f64 = 0.2;

/// Consecutive errors in one category before a forced reconnect.
const ERROR_THRESHOLD: u32 = 3;

/// Read-only metrics snapshot exposed from the client handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Enveloped frames physically written to the transport.
    pub messages_sent: u64,
    /// Inbound frames that parsed successfully.
    pub messages_received: u64,
    /// Acknowledgments for ids that were already acknowledged.
    pub duplicate_acks: u64,
    /// Latency of the most recent acknowledgment.
    pub last_latency: Option<Duration>,
    /// Exponentially smoothed acknowledgment latency.
    pub avg_latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct LatencyWindow {
    last_ms: Option<f64>,
    avg_ms: Option<f64>,
}

/// Shared between the manager task (writer) and client handles (readers).
#[derive(Debug, Default)]
pub(crate) struct LinkMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl LinkMetrics {
    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate_ack(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_latency(&self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        let mut window = self.latency.lock();
        window.last_ms = Some(ms);
        window.avg_ms = Some(match window.avg_ms {
            Some(avg) => EMA_ALPHA * ms + (1.0 - EMA_ALPHA) * avg,
            None => ms,
        });
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let window = self.latency.lock();
        MetricsSnapshot {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            duplicate_acks: self.duplicates.load(Ordering::Relaxed),
            last_latency: window.last_ms.map(|ms| Duration::from_secs_f64(ms / 1000.0)),
            avg_latency: window.avg_ms.map(|ms| Duration::from_secs_f64(ms / 1000.0)),
        }
    }
}

/// Where an error was observed, for threshold accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorCategory {
    /// Inbound parse/processing failures.
    Message,
    /// Outbound transmission failures.
    Send,
    /// Keepalive/silence failures.
    Heartbeat,
    /// Registered handler failures.
    Handler,
}

/// Per-category error counts. Three strikes in one category force a
/// reconnect and clear that category.
#[derive(Debug, Default)]
pub(crate) struct ErrorCounters {
    message: u32,
    send: u32,
    heartbeat: u32,
    handler: u32,
}

impl ErrorCounters {
    fn slot(&mut self, category: ErrorCategory) -> &mut u32 {
        match category {
            ErrorCategory::Message => &mut self.message,
            ErrorCategory::Send => &mut self.send,
            ErrorCategory::Heartbeat => &mut self.heartbeat,
            ErrorCategory::Handler => &mut self.handler,
        }
    }

    /// Record one error. Returns true when the category hit its threshold
    /// and a forced reconnect is due; the category resets in that case.
    pub(crate) fn record(&mut self, category: ErrorCategory) -> bool {
        let slot = self.slot(category);
        *slot += 1;
        if *slot >= ERROR_THRESHOLD {
            *slot = 0;
            return true;
        }
        false
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
