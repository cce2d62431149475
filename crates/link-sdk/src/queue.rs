//! Outbound queue, delivery tracking, and the drain pacer.
//!
//! Invariant: a given message id lives in at most one of the outbound
//! queue, the pending-acknowledgment map, and the acknowledged-record
//! cache at any time.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use vl_protocol::MessageId;

/// A frame that could not be sent immediately; held until the channel is
/// healthy again.
#[derive(Debug, Clone)]
pub(crate) struct OutboundMessage {
    pub id: MessageId,
    pub payload: Value,
    pub enqueued_at: Instant,
}

/// Bounded FIFO. Capacity is a hard backpressure ceiling: an enqueue at
/// capacity is a drop, not a suspend point.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    items: VecDeque<OutboundMessage>,
    capacity: usize,
}

impl OutboundQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Enqueue at the tail. At capacity the queue is left unchanged and the
    /// message is rejected.
    pub(crate) fn push_back(&mut self, msg: OutboundMessage) -> Result<(), OutboundMessage> {
        if self.items.len() >= self.capacity {
            return Err(msg);
        }
        self.items.push_back(msg);
        Ok(())
    }

    /// Requeue at the head after a failed transmit, preserving FIFO order.
    pub(crate) fn push_front(&mut self, msg: OutboundMessage) {
        self.items.push_front(msg);
    }

    pub(crate) fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.items.pop_front()
    }
}

/// Outcome of matching an echoed id against the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// First acknowledgment of a pending frame.
    Acked { latency: Duration },
    /// The id was already acknowledged earlier.
    Duplicate,
    /// The id was never pending (or already timed out).
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    sent_at: Instant,
    deadline: Instant,
}

/// Per-message delivery bookkeeping: pending acknowledgments with
/// individual deadlines, and a time-bounded acknowledged-id cache kept for
/// duplicate/metrics diagnostics only.
#[derive(Debug)]
pub(crate) struct DeliveryTracker {
    pending: HashMap<MessageId, PendingAck>,
    acked: HashMap<MessageId, Instant>,
    ack_timeout: Duration,
    retention: Duration,
}

impl DeliveryTracker {
    pub(crate) fn new(ack_timeout: Duration, retention: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            acked: HashMap::new(),
            ack_timeout,
            retention,
        }
    }

    /// Register a frame the moment it is physically written to the
    /// transport. Re-tracking an already pending id is a no-op.
    pub(crate) fn track(&mut self, id: MessageId, now: Instant) {
        self.pending.entry(id).or_insert(PendingAck {
            sent_at: now,
            deadline: now + self.ack_timeout,
        });
    }

    /// Match an echoed id against pending and acknowledged records.
    pub(crate) fn acknowledge(&mut self, id: MessageId, now: Instant) -> AckOutcome {
        if let Some(pending) = self.pending.remove(&id) {
            self.acked.insert(id, now);
            return AckOutcome::Acked {
                latency: now.saturating_duration_since(pending.sent_at),
            };
        }
        if self.acked.contains_key(&id) {
            return AckOutcome::Duplicate;
        }
        AckOutcome::Unknown
    }

    /// Remove and return every pending id whose deadline has passed. Each
    /// id is reported exactly once; the core never retries it.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<MessageId> {
        let mut expired: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in &expired {
            self.pending.remove(id);
        }
        expired
    }

    /// Discard acknowledged records older than the retention window.
    pub(crate) fn sweep_acked(&mut self, now: Instant) {
        let retention = self.retention;
        self.acked
            .retain(|_, acked_at| now.saturating_duration_since(*acked_at) <= retention);
    }

    /// Teardown: drop all pending records without firing timeouts. Their
    /// frames may or may not have been received; the caller owns retries.
    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn acked_len(&self) -> usize {
        self.acked.len()
    }
}

/// Rate-limit governor: the inter-message drain delay. Starts at the
/// baseline, doubles on each peer backpressure signal up to the ceiling,
/// and only resets when a connection opens fresh.
#[derive(Debug)]
pub(crate) struct DrainPacer {
    baseline: Duration,
    ceiling: Duration,
    current: Duration,
}

impl DrainPacer {
    pub(crate) fn new(baseline: Duration, ceiling: Duration) -> Self {
        Self {
            baseline,
            ceiling,
            current: baseline,
        }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.current
    }

    /// Peer asked us to slow down. Returns the new delay.
    pub(crate) fn on_rate_limit(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.ceiling);
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.baseline;
    }
}
