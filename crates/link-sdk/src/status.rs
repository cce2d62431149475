//! Status observer: one hook, invoked with a human-readable message and a
//! "currently usable" flag whenever lifecycle state, health, or give-up
//! conditions change.

use std::sync::Arc;
use std::time::Duration;

/// Snapshot of the link's externally visible condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// A connection attempt is in progress.
    Connecting,
    /// The transport is open and healthy.
    Connected,
    /// The link dropped; a reconnect is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Not connected and no reconnect pending.
    Disconnected,
    /// The transport is open but the peer has gone quiet.
    Unstable,
    /// An enqueue was rejected at capacity; the message was dropped.
    QueueFull,
    /// The give-up budget is spent; auto-reconnect has stopped.
    MaxRetriesExhausted { attempts: u32 },
    /// A transport-level error was recovered internally.
    TransportError { detail: String },
}

impl LinkStatus {
    /// Human-readable status line, suitable for a UI banner.
    pub fn message(&self) -> String {
        match self {
            LinkStatus::Connecting => "connecting to server".into(),
            LinkStatus::Connected => "connected to server".into(),
            LinkStatus::Reconnecting { attempt, delay } => {
                format!("connection lost, retry {attempt} in {delay:?}")
            }
            LinkStatus::Disconnected => "disconnected".into(),
            LinkStatus::Unstable => "connection unstable".into(),
            LinkStatus::QueueFull => "message queue full".into(),
            LinkStatus::MaxRetriesExhausted { attempts } => {
                format!("max reconnection attempts reached ({attempts})")
            }
            LinkStatus::TransportError { detail } => format!("transport error: {detail}"),
        }
    }

    /// Whether the link can currently carry traffic.
    pub fn usable(&self) -> bool {
        matches!(self, LinkStatus::Connected)
    }

    /// Event statuses are emitted every time they occur; lifecycle statuses
    /// are deduplicated when repeated back to back.
    fn is_event(&self) -> bool {
        matches!(
            self,
            LinkStatus::QueueFull
                | LinkStatus::TransportError { .. }
                | LinkStatus::MaxRetriesExhausted { .. }
        )
    }
}

/// Observer callback registered through the builder.
pub type StatusHook = Arc<dyn Fn(LinkStatus) + Send + Sync>;

/// Emits statuses to the hook, suppressing consecutive duplicate lifecycle
/// statuses.
pub(crate) struct StatusReporter {
    hook: Option<StatusHook>,
    last: Option<LinkStatus>,
}

impl StatusReporter {
    pub(crate) fn new(hook: Option<StatusHook>) -> Self {
        Self { hook, last: None }
    }

    pub(crate) fn emit(&mut self, status: LinkStatus) {
        if !status.is_event() && self.last.as_ref() == Some(&status) {
            return;
        }
        tracing::debug!(status = %status.message(), usable = status.usable(), "link status");
        if let Some(hook) = &self.hook {
            hook(status.clone());
        }
        self.last = Some(status);
    }
}
