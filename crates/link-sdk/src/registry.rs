//! Handler registry: maps an application frame tag to exactly one handler.
//!
//! The link layer never interprets application payloads beyond the `type`
//! tag and the optional echoed id; everything else is the handler's
//! business.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use vl_protocol::MessageId;

/// An application frame as delivered to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The frame's `type` tag.
    pub tag: String,
    /// Id echoed from an earlier outbound frame, if the peer included one.
    pub echoed_id: Option<MessageId>,
    /// The whole frame object, untouched.
    pub payload: Value,
}

/// Implement this to receive application frames for a tag.
///
/// Handlers run on the manager task; a returned error or a panic is
/// reported and swallowed so one faulty handler cannot break the channel.
#[async_trait::async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()>;
}

/// Wrap a synchronous closure as a [`FrameHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn FrameHandler>
where
    F: Fn(Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
{
    struct SyncFn<F>(F);

    #[async_trait::async_trait]
    impl<F> FrameHandler for SyncFn<F>
    where
        F: Fn(Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
            (self.0)(delivery)
        }
    }

    Arc::new(SyncFn(f))
}

/// Tag → handler map. The last registration for a tag wins; entries
/// persist for the manager's lifetime.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn FrameHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact tag, replacing any previous one.
    pub fn register<H: FrameHandler>(&mut self, tag: impl Into<String>, handler: H) -> &mut Self {
        self.handlers.insert(tag.into(), Arc::new(handler));
        self
    }

    /// Register a pre-wrapped handler (e.g. from [`handler_fn`]).
    pub fn register_boxed(
        &mut self,
        tag: impl Into<String>,
        handler: Arc<dyn FrameHandler>,
    ) -> &mut Self {
        self.handlers.insert(tag.into(), handler);
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn FrameHandler>> {
        self.handlers.get(tag).cloned()
    }

    /// All registered tags (sorted).
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.handlers.keys().cloned().collect();
        tags.sort();
        tags
    }
}

/// Registry shared between client handles (registration) and the manager
/// task (dispatch).
pub(crate) type SharedRegistry = Arc<RwLock<HandlerRegistry>>;
