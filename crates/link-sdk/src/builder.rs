//! Builder pattern for constructing and spawning a [`LinkClient`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vl_protocol::{endpoint_from_origin, IdAllocator, MessageId};

use crate::backoff::ReconnectBackoff;
use crate::client::LinkClient;
use crate::health::HealthProbe;
use crate::manager::LinkManager;
use crate::metrics::LinkMetrics;
use crate::registry::HandlerRegistry;
use crate::status::StatusHook;
use crate::types::LinkError;

/// Per-message timeout hook registered through the builder.
pub type TimeoutHook = Arc<dyn Fn(MessageId) + Send + Sync>;

/// Resolved manager configuration.
#[derive(Clone)]
pub(crate) struct LinkConfig {
    pub endpoint: String,
    pub keepalive_interval: Duration,
    pub connection_timeout: Duration,
    pub message_timeout: Duration,
    pub min_reconnect_wait: Duration,
    pub backoff: ReconnectBackoff,
    pub queue_capacity: usize,
    pub drain_pause: Duration,
    pub rate_limit_ceiling: Duration,
    pub ack_retention: Duration,
    pub maintenance_interval: Duration,
    pub on_status: Option<StatusHook>,
    pub on_timeout: Option<TimeoutHook>,
}

/// Fluent builder for [`LinkClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use vl_link_sdk::LinkClientBuilder;
/// # async fn demo() -> Result<(), vl_link_sdk::LinkError> {
/// let link = LinkClientBuilder::new()
///     .origin("https://app.example")?
///     .on_status(|status| println!("{} ({})", status.message(), status.usable()))
///     .spawn()?;
/// link.connect();
/// # Ok(())
/// # }
/// ```
pub struct LinkClientBuilder {
    endpoint: Option<String>,
    keepalive_interval: Duration,
    connection_timeout: Duration,
    message_timeout: Duration,
    min_reconnect_wait: Duration,
    backoff: ReconnectBackoff,
    queue_capacity: usize,
    drain_pause: Duration,
    rate_limit_ceiling: Duration,
    ack_retention: Duration,
    maintenance_interval: Duration,
    registry: HandlerRegistry,
    on_status: Option<StatusHook>,
    on_timeout: Option<TimeoutHook>,
}

impl LinkClientBuilder {
    pub fn new() -> Self {
        Self {
            endpoint: None,
            keepalive_interval: Duration::from_secs(25),
            connection_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(30),
            min_reconnect_wait: Duration::from_secs(1),
            backoff: ReconnectBackoff::default(),
            queue_capacity: 100,
            drain_pause: Duration::from_millis(100),
            rate_limit_ceiling: Duration::from_secs(30),
            ack_retention: Duration::from_secs(300), // 5 minutes
            maintenance_interval: Duration::from_secs(30),
            registry: HandlerRegistry::new(),
            on_status: None,
            on_timeout: None,
        }
    }

    // ── Endpoint ─────────────────────────────────────────────────────

    /// Set the duplex endpoint URL directly (e.g. `wss://host/ws`).
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Derive the endpoint from a page origin, mirroring the scheme and
    /// appending the fixed path.
    pub fn origin(mut self, origin: &str) -> Result<Self, LinkError> {
        self.endpoint = Some(endpoint_from_origin(origin)?);
        Ok(self)
    }

    // ── Timing ───────────────────────────────────────────────────────

    /// Keepalive cadence (default 25s). Health bounds derive from this.
    pub fn keepalive_interval(mut self, d: Duration) -> Self {
        self.keepalive_interval = d;
        self
    }

    /// How long a transport open may take (default 5s).
    pub fn connection_timeout(mut self, d: Duration) -> Self {
        self.connection_timeout = d;
        self
    }

    /// Per-message acknowledgment window (default 30s).
    pub fn message_timeout(mut self, d: Duration) -> Self {
        self.message_timeout = d;
        self
    }

    /// Thrash guard between connection attempts (default 1s).
    pub fn min_reconnect_wait(mut self, d: Duration) -> Self {
        self.min_reconnect_wait = d;
        self
    }

    /// Override the reconnect backoff policy.
    pub fn reconnect_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Acknowledged-record retention window (default 5 minutes).
    pub fn ack_retention(mut self, d: Duration) -> Self {
        self.ack_retention = d;
        self
    }

    /// Cadence of the coarse maintenance sweep (default 30s).
    pub fn maintenance_interval(mut self, d: Duration) -> Self {
        self.maintenance_interval = d;
        self
    }

    // ── Throughput ───────────────────────────────────────────────────

    /// Outbound queue capacity (default 100). A hard ceiling: enqueues at
    /// capacity are dropped with a `QueueFull` status.
    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    /// Baseline inter-message pause while draining the queue (default 100ms).
    pub fn drain_pause(mut self, d: Duration) -> Self {
        self.drain_pause = d;
        self
    }

    /// Ceiling for the rate-limit-inflated drain delay (default 30s).
    pub fn rate_limit_ceiling(mut self, d: Duration) -> Self {
        self.rate_limit_ceiling = d;
        self
    }

    // ── Hooks & handlers ─────────────────────────────────────────────

    /// Seed the handler registry. More handlers can be registered on the
    /// running client at any time.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Status observer: invoked on every lifecycle, health, or give-up
    /// change with a value carrying the human-readable message and the
    /// "currently usable" flag.
    pub fn on_status<F>(mut self, hook: F) -> Self
    where
        F: Fn(crate::status::LinkStatus) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(hook));
        self
    }

    /// Per-message timeout hook: invoked once for each frame that was
    /// written but never acknowledged within the message timeout.
    pub fn on_timeout<F>(mut self, hook: F) -> Self
    where
        F: Fn(MessageId) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration, spawn the manager task, and return the
    /// client handle. Must be called from within a Tokio runtime.
    pub fn spawn(self) -> Result<LinkClient, LinkError> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| LinkError::Config("endpoint or origin is required".into()))?;
        if self.queue_capacity == 0 {
            return Err(LinkError::Config("queue_capacity must be at least 1".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(LinkError::Config("keepalive_interval must be non-zero".into()));
        }

        let config = LinkConfig {
            endpoint,
            keepalive_interval: self.keepalive_interval,
            connection_timeout: self.connection_timeout,
            message_timeout: self.message_timeout,
            min_reconnect_wait: self.min_reconnect_wait,
            backoff: self.backoff,
            queue_capacity: self.queue_capacity,
            drain_pause: self.drain_pause,
            rate_limit_ceiling: self.rate_limit_ceiling,
            ack_retention: self.ack_retention,
            maintenance_interval: self.maintenance_interval,
            on_status: self.on_status,
            on_timeout: self.on_timeout,
        };

        let probe = Arc::new(HealthProbe::new(config.keepalive_interval));
        let metrics = Arc::new(LinkMetrics::default());
        let registry = Arc::new(RwLock::new(self.registry));
        let ids = Arc::new(IdAllocator::new());
        let shutdown = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let manager = LinkManager::new(
            config,
            command_rx,
            registry.clone(),
            probe.clone(),
            metrics.clone(),
            shutdown.clone(),
        );
        let task = tokio::spawn(manager.run());

        Ok(LinkClient::new(
            command_tx, ids, probe, registry, metrics, shutdown, task,
        ))
    }
}

impl Default for LinkClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
