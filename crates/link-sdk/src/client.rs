//! The caller-facing handle to a running link.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vl_protocol::{Envelope, IdAllocator, MessageId};

use crate::health::HealthProbe;
use crate::metrics::{LinkMetrics, MetricsSnapshot};
use crate::registry::{FrameHandler, HandlerRegistry};

/// Commands flowing from handles to the manager task, which exclusively
/// owns the socket, the outbound queue, and the delivery maps.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Send(Envelope),
    ForceReconnect,
}

/// Handle to a spawned link manager.
///
/// Created by [`LinkClientBuilder::spawn`](crate::LinkClientBuilder::spawn).
/// All mutation flows through the manager's command channel; the handle
/// itself only allocates ids and reads shared state.
pub struct LinkClient {
    commands: mpsc::UnboundedSender<Command>,
    ids: Arc<IdAllocator>,
    probe: Arc<HealthProbe>,
    registry: Arc<RwLock<HandlerRegistry>>,
    metrics: Arc<LinkMetrics>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for LinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkClient")
            .field("commands", &self.commands)
            .field("ids", &self.ids)
            .field("probe", &self.probe)
            .field("metrics", &self.metrics)
            .field("shutdown", &self.shutdown)
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl LinkClient {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        ids: Arc<IdAllocator>,
        probe: Arc<HealthProbe>,
        registry: Arc<RwLock<HandlerRegistry>>,
        metrics: Arc<LinkMetrics>,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            ids,
            probe,
            registry,
            metrics,
            shutdown,
            task,
        }
    }

    /// Ask the manager to open the connection. Idempotent while an attempt
    /// is already in flight; after a give-up, this restarts the budget.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Send a payload, returning its assigned id.
    ///
    /// The payload must be a JSON object with a string `type` tag. If the
    /// channel is healthy the frame goes out immediately and is tracked
    /// for acknowledgment; otherwise it is queued and a connection attempt
    /// is triggered. A full queue drops the payload and emits a
    /// `QueueFull` status; send never blocks.
    pub fn send(&self, payload: Value) -> MessageId {
        let id = self.ids.allocate();
        let _ = self.commands.send(Command::Send(Envelope::new(id, payload)));
        id
    }

    /// Register (or replace) the handler for an application frame tag.
    pub fn register_handler<H: FrameHandler>(&self, tag: impl Into<String>, handler: H) {
        self.registry.write().register(tag, handler);
    }

    /// Register a pre-wrapped handler (e.g. from
    /// [`handler_fn`](crate::registry::handler_fn)).
    pub fn register_handler_boxed(
        &self,
        tag: impl Into<String>,
        handler: Arc<dyn FrameHandler>,
    ) {
        self.registry.write().register_boxed(tag, handler);
    }

    /// Read-only health predicate: transport open and the peer heard from
    /// recently enough.
    pub fn is_healthy(&self) -> bool {
        self.probe.is_healthy()
    }

    /// Tear down the current transport and immediately reconnect. Resets
    /// the give-up budget; queued messages survive.
    pub fn force_reconnect(&self) {
        let _ = self.commands.send(Command::ForceReconnect);
    }

    /// Current connection-quality metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Tear down the whole manager: cancels every pending timeout, closes
    /// the transport, and waits for the task to exit.
    pub async fn destroy(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}
