//! `vl-link-sdk` — resilient duplex link for VoiceLink clients.
//!
//! A persistent WebSocket channel that survives flaky networks: it detects
//! silent failures with keepalives, reconnects with capped exponential
//! backoff and a bounded give-up budget, queues messages through outages,
//! paces the flush when the peer signals backpressure, and gives every
//! outbound frame an at-most-one-in-flight delivery/acknowledgment
//! contract.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Your client                                             │
//! │                                                          │
//! │   let link = LinkClientBuilder::new()                    │
//! │       .origin("https://app.example")?                    │
//! │       .on_status(|s| banner(s.message(), s.usable()))    │
//! │       .spawn()?;                                         │
//! │                                                          │
//! │   link.register_handler_boxed("query_result", handler);  │
//! │   link.connect();                                        │
//! │   let id = link.send(json!({ "type": "query", .. }));    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle (owned by the manager task)
//!
//! 1. `connect()` dials the endpoint, guarded by a thrash window and the
//!    give-up budget; the open has its own timeout.
//! 2. On open: backoff resets to its floor, the keepalive timer starts,
//!    and queued messages flush one by one with an inter-message pause.
//! 3. Inbound frames refresh liveness; echoed ids settle pending
//!    acknowledgments; reserved tags (`pong`, `ping`, `rate_limit`) are
//!    handled internally and everything else dispatches by tag.
//! 4. On silence past 1.5x the keepalive interval (or 2x, caught by the
//!    coarser maintenance sweep) the link force-reconnects on its own.
//! 5. `destroy()` cancels every timer and closes the transport.
//!
//! Status changes surface through a single observer hook; per-message
//! timeouts through another. Neither is required.

pub mod backoff;
pub mod builder;
pub mod client;
pub mod metrics;
pub mod registry;
pub mod status;
pub mod types;

mod health;
mod manager;
mod queue;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use backoff::ReconnectBackoff;
pub use builder::{LinkClientBuilder, TimeoutHook};
pub use client::LinkClient;
pub use metrics::MetricsSnapshot;
pub use registry::{handler_fn, Delivery, FrameHandler, HandlerRegistry};
pub use status::{LinkStatus, StatusHook};
pub use types::LinkError;

// Re-export the protocol surface so callers never need vl-protocol
// directly.
pub use vl_protocol::{Envelope, MessageId, ProtocolError};
