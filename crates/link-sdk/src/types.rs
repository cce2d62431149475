//! Error taxonomy for the link layer.

use vl_protocol::{MessageId, ProtocolError};

/// Everything that can go wrong on the link.
///
/// Runtime failures are recovered internally by the reconnection
/// controller and surfaced through the status observer: a
/// `LinkStatus::TransportError` carries the formatted `ConnectionTimeout`,
/// `AbnormalClosure`, or `Transmission` that caused it. `MalformedFrame`
/// and `Handler` are swallowed at the dispatch boundary so one bad frame
/// or one misbehaving handler cannot take down the channel; `Config` is
/// the only variant returned directly to callers (from the builder).
/// Queue-full and give-up conditions are first-class `LinkStatus`
/// variants, not errors.
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("abnormal closure (code {0})")]
    AbnormalClosure(u16),

    #[error("transmission failed: {0}")]
    Transmission(String),

    #[error("{0} timed out awaiting acknowledgment")]
    MessageTimeout(MessageId),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] ProtocolError),

    #[error("handler for `{tag}` failed: {message}")]
    Handler { tag: String, message: String },

    #[error("config: {0}")]
    Config(String),
}
