//! Link protocol: frame envelope, message ids, and the inbound frame parser.
//!
//! Every frame on the wire is a JSON object with a `type` tag. Outbound
//! frames additionally carry a process-unique, strictly increasing
//! `messageId`; inbound frames may echo a `messageId` to acknowledge an
//! earlier outbound frame. Three tags are reserved for the link layer
//! itself (`ping`, `pong`, `rate_limit`); everything else is opaque
//! application traffic routed by tag.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key under which the envelope id is merged into outbound frames.
pub const MESSAGE_ID_KEY: &str = "messageId";
/// Key carrying the frame tag.
pub const TYPE_KEY: &str = "type";

/// Outbound keepalive probe.
pub const TAG_PING: &str = "ping";
/// Keepalive response; refreshes liveness.
pub const TAG_PONG: &str = "pong";
/// Peer backpressure signal; inflates the drain delay.
pub const TAG_RATE_LIMIT: &str = "rate_limit";

/// Fixed path of the duplex endpoint, appended to the page origin.
pub const LINK_PATH: &str = "/ws";

/// Process-unique, strictly increasing id stamped on every outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Allocates [`MessageId`]s. One allocator per link; ids start at 1 and
/// never repeat for the life of the process.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> MessageId {
        MessageId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Errors raised while encoding or decoding frames.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload is missing a string `type` tag")]
    MissingTag,

    #[error("payload already carries a `{MESSAGE_ID_KEY}` field")]
    IdCollision,

    #[error("unsupported origin: {0}")]
    BadOrigin(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// An outbound payload wrapped with its link-layer id.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: MessageId,
    pub payload: Value,
}

impl Envelope {
    pub fn new(id: MessageId, payload: Value) -> Self {
        Self { id, payload }
    }

    /// Serialize the envelope to wire text: the payload object with
    /// `messageId` merged in.
    ///
    /// The payload must be a JSON object carrying a string `type` tag and
    /// must not already contain a `messageId`.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let obj = self.payload.as_object().ok_or(ProtocolError::NotAnObject)?;
        if !obj.get(TYPE_KEY).map(Value::is_string).unwrap_or(false) {
            return Err(ProtocolError::MissingTag);
        }
        if obj.contains_key(MESSAGE_ID_KEY) {
            return Err(ProtocolError::IdCollision);
        }

        let mut framed = obj.clone();
        framed.insert(MESSAGE_ID_KEY.into(), Value::from(self.id.0));
        Ok(serde_json::to_string(&Value::Object(framed))?)
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Id echoed from an earlier outbound frame, if any. Triggers
    /// acknowledgment matching in the delivery tracker.
    pub echoed_id: Option<MessageId>,
    pub frame: InboundFrame,
}

/// Inbound frame kinds. Reserved tags get their own variants; everything
/// else arrives as [`InboundFrame::App`] with the raw tag and payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Keepalive response from the peer.
    Pong { timestamp: Option<i64> },
    /// Keepalive probe from the peer; answered with a pong.
    Ping { timestamp: Option<i64> },
    /// Backpressure signal.
    RateLimit,
    /// Application traffic, opaque to the link layer.
    App { tag: String, payload: Value },
}

/// Parse one inbound wire frame.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("frame is not a JSON object".into()))?;

    let tag = obj
        .get(TYPE_KEY)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingTag)?;

    let echoed_id = match obj.get(MESSAGE_ID_KEY) {
        None | Some(Value::Null) => None,
        Some(v) => Some(MessageId(v.as_u64().ok_or_else(|| {
            ProtocolError::Malformed(format!("non-numeric {MESSAGE_ID_KEY}: {v}"))
        })?)),
    };

    let timestamp = obj.get("timestamp").and_then(Value::as_i64);
    let frame = match tag {
        TAG_PONG => InboundFrame::Pong { timestamp },
        TAG_PING => InboundFrame::Ping { timestamp },
        TAG_RATE_LIMIT => InboundFrame::RateLimit,
        other => InboundFrame::App {
            tag: other.to_string(),
            payload: value.clone(),
        },
    };

    Ok(Inbound { echoed_id, frame })
}

/// Build an outbound keepalive probe.
pub fn ping_frame() -> Value {
    serde_json::json!({
        TYPE_KEY: TAG_PING,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
}

/// Build a keepalive response echoing the peer's timestamp.
pub fn pong_frame(timestamp: Option<i64>) -> Value {
    serde_json::json!({
        TYPE_KEY: TAG_PONG,
        "timestamp": timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
    })
}

/// Derive the duplex endpoint from a page origin, mirroring the scheme
/// (`https` → `wss`, `http` → `ws`) and appending the fixed [`LINK_PATH`].
pub fn endpoint_from_origin(origin: &str) -> Result<String, ProtocolError> {
    let origin = origin.trim_end_matches('/');
    if let Some(rest) = origin.strip_prefix("https://") {
        Ok(format!("wss://{rest}{LINK_PATH}"))
    } else if let Some(rest) = origin.strip_prefix("http://") {
        Ok(format!("ws://{rest}{LINK_PATH}"))
    } else {
        Err(ProtocolError::BadOrigin(origin.to_string()))
    }
}
