//! The connection manager task: owns the socket, the outbound queue, and
//! the delivery maps, and drives the reconnection state machine.
//!
//! Exactly one logical thread of control: every timer, socket event, and
//! caller command is an interleaved arm of the session `select!`, so no
//! locks guard the queue or the delivery maps.

use std::future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use vl_protocol::{decode, ping_frame, pong_frame, Envelope, InboundFrame, MessageId};

use crate::backoff::{ConnectGate, ReconnectState};
use crate::builder::LinkConfig;
use crate::client::Command;
use crate::health::HealthProbe;
use crate::metrics::{ErrorCategory, ErrorCounters, LinkMetrics};
use crate::queue::{AckOutcome, DeliveryTracker, DrainPacer, OutboundMessage, OutboundQueue};
use crate::registry::{Delivery, SharedRegistry};
use crate::status::{LinkStatus, StatusReporter};
use crate::types::LinkError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle phase of the manager; exactly one at any time.
#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Not connected and no reconnect pending. `exhausted` marks the
    /// permanent give-up variant, left only by an external `connect()`.
    Idle { exhausted: bool },
    /// A connection attempt is due. `forced` bypasses the attempt guards.
    Connect { forced: bool },
    /// Waiting out the backoff delay before the next attempt.
    Backoff { delay: Duration },
    Halt,
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Peer closed cleanly: reschedule without doubling the backoff.
    Clean,
    /// Transport failure or abnormal closure: double the backoff.
    Unclean { detail: String },
    /// Health monitor, delivery tracker, or caller forced a reconnect:
    /// tear down and re-dial immediately with a fresh give-up budget.
    Forced,
    Shutdown,
}

enum SessionEvent {
    Cmd(Option<Command>),
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Keepalive,
    Maintenance,
    Sweep,
    Drain,
    Shutdown,
}

/// Whether the session keeps running after an event.
enum Flow {
    Continue,
    End(SessionEnd),
}

pub(crate) struct LinkManager {
    cfg: LinkConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    registry: SharedRegistry,
    probe: Arc<HealthProbe>,
    metrics: Arc<LinkMetrics>,
    shutdown: CancellationToken,
    reporter: StatusReporter,
    backoff: ReconnectState,
    queue: OutboundQueue,
    tracker: DeliveryTracker,
    pacer: DrainPacer,
    errors: ErrorCounters,
}

impl LinkManager {
    pub(crate) fn new(
        cfg: LinkConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        registry: SharedRegistry,
        probe: Arc<HealthProbe>,
        metrics: Arc<LinkMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let reporter = StatusReporter::new(cfg.on_status.clone());
        let backoff = ReconnectState::new(cfg.backoff.clone());
        let queue = OutboundQueue::new(cfg.queue_capacity);
        let tracker = DeliveryTracker::new(cfg.message_timeout, cfg.ack_retention);
        let pacer = DrainPacer::new(cfg.drain_pause, cfg.rate_limit_ceiling);
        Self {
            cfg,
            commands,
            registry,
            probe,
            metrics,
            shutdown,
            reporter,
            backoff,
            queue,
            tracker,
            pacer,
            errors: ErrorCounters::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut phase = Phase::Idle { exhausted: false };
        loop {
            phase = match phase {
                Phase::Idle { exhausted } => self.idle(exhausted).await,
                Phase::Connect { forced } => self.attempt(forced).await,
                Phase::Backoff { delay } => self.backoff_wait(delay).await,
                Phase::Halt => break,
            };
        }
        self.probe.mark_closed();
        self.tracker.clear_pending();
        tracing::info!("link manager stopped");
    }

    /// Disconnected: wait for a caller to wake us up.
    async fn idle(&mut self, exhausted: bool) -> Phase {
        if !exhausted {
            self.reporter.emit(LinkStatus::Disconnected);
        }
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Phase::Halt,
                cmd = self.commands.recv() => match cmd {
                    None => return Phase::Halt,
                    Some(Command::Connect) => {
                        if exhausted {
                            // An explicit connect() restarts the budget.
                            self.backoff.reset_budget();
                        }
                        return Phase::Connect { forced: false };
                    }
                    Some(Command::ForceReconnect) => {
                        self.backoff.reset_budget();
                        return Phase::Connect { forced: true };
                    }
                    Some(Command::Send(envelope)) => {
                        self.enqueue(envelope);
                        if !exhausted {
                            return Phase::Connect { forced: false };
                        }
                        // After a give-up, messages queue but nothing dials
                        // until connect() is called again.
                    }
                },
            }
        }
    }

    /// One gated connection attempt, then the session it opens.
    async fn attempt(&mut self, forced: bool) -> Phase {
        match self
            .backoff
            .begin_attempt(Instant::now(), self.cfg.min_reconnect_wait, forced)
        {
            Err(ConnectGate::Exhausted) => {
                let attempts = self.backoff.attempts_used();
                tracing::error!(attempts, "max reconnect attempts exhausted");
                self.reporter.emit(LinkStatus::MaxRetriesExhausted { attempts });
                return Phase::Idle { exhausted: true };
            }
            Err(ConnectGate::TooSoon { retry_in }) => {
                // Reschedule rather than drop to idle, or a backoff floor
                // below the thrash guard would strand queued messages.
                tracing::debug!(?retry_in, "attempt gated by the thrash guard, rescheduling");
                return Phase::Backoff { delay: retry_in };
            }
            Ok(attempt) => {
                tracing::info!(endpoint = %self.cfg.endpoint, attempt, "connecting");
            }
        }
        self.reporter.emit(LinkStatus::Connecting);

        let dial = tokio_tungstenite::connect_async(&self.cfg.endpoint);
        let opened = tokio::select! {
            _ = self.shutdown.cancelled() => return Phase::Halt,
            r = tokio::time::timeout(self.cfg.connection_timeout, dial) => r,
        };

        let socket = match opened {
            Err(_elapsed) => {
                tracing::warn!(timeout = ?self.cfg.connection_timeout, "connection attempt timed out");
                self.reporter.emit(LinkStatus::TransportError {
                    detail: LinkError::ConnectionTimeout.to_string(),
                });
                let delay = self.backoff.next_delay();
                return Phase::Backoff { delay };
            }
            Ok(Err(e)) => {
                let err = LinkError::Transmission(e.to_string());
                tracing::warn!(error = %err, "transport error while connecting");
                self.reporter.emit(LinkStatus::TransportError { detail: err.to_string() });
                let delay = self.backoff.next_delay();
                return Phase::Backoff { delay };
            }
            Ok(Ok((socket, _response))) => socket,
        };

        self.on_open();
        let end = self.session(socket).await;
        self.on_closed();
        match end {
            SessionEnd::Clean => {
                tracing::info!("connection closed cleanly");
                self.reporter.emit(LinkStatus::Disconnected);
                Phase::Backoff {
                    delay: self.backoff.peek_delay(),
                }
            }
            SessionEnd::Unclean { detail } => {
                tracing::warn!(detail = %detail, "connection lost");
                self.reporter.emit(LinkStatus::TransportError { detail });
                let delay = self.backoff.next_delay();
                Phase::Backoff { delay }
            }
            SessionEnd::Forced => {
                // Forced reconnects are free with respect to the give-up
                // budget; queued messages survive the teardown.
                self.backoff.reset_budget();
                Phase::Connect { forced: true }
            }
            SessionEnd::Shutdown => Phase::Halt,
        }
    }

    /// Reconnect scheduled: sleep out the delay, still servicing sends.
    async fn backoff_wait(&mut self, delay: Duration) -> Phase {
        self.reporter.emit(LinkStatus::Reconnecting {
            attempt: self.backoff.attempts_used() + 1,
            delay,
        });
        let wake = tokio::time::sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Phase::Halt,
                _ = &mut wake => return Phase::Connect { forced: false },
                cmd = self.commands.recv() => match cmd {
                    None => return Phase::Halt,
                    Some(Command::Connect) => return Phase::Connect { forced: false },
                    Some(Command::ForceReconnect) => {
                        self.backoff.reset_budget();
                        return Phase::Connect { forced: true };
                    }
                    Some(Command::Send(envelope)) => self.enqueue(envelope),
                },
            }
        }
    }

    fn on_open(&mut self) {
        self.backoff.on_success();
        self.pacer.reset();
        self.errors.reset();
        self.probe.mark_open();
        self.reporter.emit(LinkStatus::Connected);
    }

    fn on_closed(&mut self) {
        self.probe.mark_closed();
        // Pending frames may or may not have been received; the caller owns
        // retries, so they are dropped without firing the timeout hook.
        self.tracker.clear_pending();
    }

    /// The connected event loop.
    async fn session(&mut self, mut socket: Socket) -> SessionEnd {
        let mut keepalive = tokio::time::interval(self.cfg.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = tokio::time::interval(self.cfg.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_period = (self.cfg.message_timeout / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval's first tick is immediate; consume it so ticks land
        // on cadence.
        keepalive.tick().await;
        maintenance.tick().await;
        sweep.tick().await;

        // Flush anything queued during the outage, paced by the governor.
        let mut drain_at = if self.queue.is_empty() {
            None
        } else {
            Some(tokio::time::Instant::now())
        };

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => SessionEvent::Shutdown,
                cmd = self.commands.recv() => SessionEvent::Cmd(cmd),
                frame = socket.next() => SessionEvent::Frame(frame),
                _ = keepalive.tick() => SessionEvent::Keepalive,
                _ = maintenance.tick() => SessionEvent::Maintenance,
                _ = sweep.tick() => SessionEvent::Sweep,
                _ = wait_until(drain_at) => SessionEvent::Drain,
            };

            let flow = match event {
                SessionEvent::Shutdown | SessionEvent::Cmd(None) => {
                    let _ = socket.close(None).await;
                    return SessionEnd::Shutdown;
                }
                SessionEvent::Cmd(Some(cmd)) => self.on_command(cmd, &mut socket).await,
                SessionEvent::Frame(None) => Flow::End(SessionEnd::Unclean {
                    detail: LinkError::Transmission("connection reset".into()).to_string(),
                }),
                SessionEvent::Frame(Some(Err(e))) => Flow::End(SessionEnd::Unclean {
                    detail: LinkError::Transmission(e.to_string()).to_string(),
                }),
                SessionEvent::Frame(Some(Ok(msg))) => {
                    self.on_frame(msg, &mut socket, &mut drain_at).await
                }
                SessionEvent::Keepalive => self.on_keepalive(&mut socket, &mut drain_at).await,
                SessionEvent::Maintenance => self.on_maintenance(),
                SessionEvent::Sweep => self.on_sweep(),
                SessionEvent::Drain => self.on_drain(&mut socket, &mut drain_at).await,
            };

            if let Flow::End(end) = flow {
                let _ = socket.close(None).await;
                return end;
            }
        }
    }

    async fn on_command(&mut self, cmd: Command, socket: &mut Socket) -> Flow {
        match cmd {
            Command::Connect => {
                tracing::debug!("already connected");
                Flow::Continue
            }
            Command::ForceReconnect => {
                tracing::info!("forced reconnect requested");
                Flow::End(SessionEnd::Forced)
            }
            Command::Send(envelope) => {
                // Capacity is a hard ceiling even on the immediate path.
                if self.queue.is_full() {
                    tracing::warn!(id = %envelope.id, "outbound queue full, dropping message");
                    self.reporter.emit(LinkStatus::QueueFull);
                    return Flow::Continue;
                }
                if self.probe.is_healthy() {
                    self.transmit(envelope, socket).await
                } else {
                    tracing::debug!(id = %envelope.id, "channel unhealthy, queueing message");
                    self.enqueue(envelope);
                    Flow::Continue
                }
            }
        }
    }

    /// Write one enveloped frame and register it for acknowledgment.
    async fn transmit(&mut self, envelope: Envelope, socket: &mut Socket) -> Flow {
        let id = envelope.id;
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                // Codec failures are deterministic; requeueing would loop.
                let err = LinkError::MalformedFrame(e);
                tracing::error!(id = %id, error = %err, "failed to encode outbound frame");
                self.reporter.emit(LinkStatus::TransportError { detail: err.to_string() });
                if self.errors.record(ErrorCategory::Send) {
                    return Flow::End(SessionEnd::Forced);
                }
                return Flow::Continue;
            }
        };
        match socket.send(Message::Text(text)).await {
            Ok(()) => {
                self.tracker.track(id, Instant::now());
                self.metrics.record_sent();
                tracing::debug!(id = %id, "message sent");
                Flow::Continue
            }
            Err(e) => {
                let err = LinkError::Transmission(e.to_string());
                tracing::warn!(id = %id, error = %err, "send failed, requeueing and reconnecting");
                self.queue.push_front(OutboundMessage {
                    id,
                    payload: envelope.payload,
                    enqueued_at: Instant::now(),
                });
                self.reporter.emit(LinkStatus::TransportError { detail: err.to_string() });
                self.errors.record(ErrorCategory::Send);
                Flow::End(SessionEnd::Forced)
            }
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        let Envelope { id, payload } = envelope;
        let msg = OutboundMessage {
            id,
            payload,
            enqueued_at: Instant::now(),
        };
        if let Err(dropped) = self.queue.push_back(msg) {
            tracing::warn!(id = %dropped.id, queued = self.queue.len(), "outbound queue full, dropping message");
            self.reporter.emit(LinkStatus::QueueFull);
        } else {
            tracing::debug!(id = %id, queued = self.queue.len(), "message queued");
        }
    }

    async fn on_frame(
        &mut self,
        msg: Message,
        socket: &mut Socket,
        drain_at: &mut Option<tokio::time::Instant>,
    ) -> Flow {
        match msg {
            Message::Text(text) => self.on_text(&text, socket, drain_at).await,
            Message::Close(frame) => {
                let (clean, code) = match &frame {
                    Some(f) => (
                        matches!(f.code, CloseCode::Normal | CloseCode::Away),
                        u16::from(f.code),
                    ),
                    // No close frame at all is the abnormal-closure case.
                    None => (false, 1006),
                };
                if clean {
                    tracing::info!(code, "peer closed the connection");
                    Flow::End(SessionEnd::Clean)
                } else {
                    tracing::warn!(code, "abnormal closure");
                    Flow::End(SessionEnd::Unclean {
                        detail: LinkError::AbnormalClosure(code).to_string(),
                    })
                }
            }
            Message::Ping(_) | Message::Pong(_) => {
                self.probe.touch_activity();
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    async fn on_text(
        &mut self,
        text: &str,
        socket: &mut Socket,
        drain_at: &mut Option<tokio::time::Instant>,
    ) -> Flow {
        let inbound = match decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(error = %LinkError::MalformedFrame(e), "malformed inbound frame");
                if self.errors.record(ErrorCategory::Message) {
                    return Flow::End(SessionEnd::Forced);
                }
                return Flow::Continue;
            }
        };

        self.probe.touch_activity();
        self.metrics.record_received();

        if let Some(id) = inbound.echoed_id {
            match self.tracker.acknowledge(id, Instant::now()) {
                AckOutcome::Acked { latency } => {
                    self.metrics.record_latency(latency);
                    tracing::debug!(id = %id, ?latency, "message acknowledged");
                }
                AckOutcome::Duplicate => {
                    self.metrics.record_duplicate_ack();
                    tracing::debug!(id = %id, "duplicate acknowledgment");
                }
                AckOutcome::Unknown => {
                    tracing::trace!(id = %id, "acknowledgment for unknown id");
                }
            }
        }

        match inbound.frame {
            InboundFrame::Pong { .. } => {
                self.probe.touch_keepalive();
                Flow::Continue
            }
            InboundFrame::Ping { timestamp } => {
                let pong = pong_frame(timestamp);
                self.send_control(socket, &pong).await
            }
            InboundFrame::RateLimit => {
                let delay = self.pacer.on_rate_limit();
                tracing::info!(?delay, "rate limit signal, slowing queue drain");
                if !self.queue.is_empty() {
                    *drain_at = Some(tokio::time::Instant::now() + delay);
                }
                Flow::Continue
            }
            InboundFrame::App { tag, payload } => {
                self.dispatch(tag, inbound.echoed_id, payload).await
            }
        }
    }

    /// Route an application frame to its registered handler. Handler
    /// errors and panics are reported, never propagated.
    async fn dispatch(
        &mut self,
        tag: String,
        echoed_id: Option<MessageId>,
        payload: Value,
    ) -> Flow {
        let handler = self.registry.read().get(&tag);
        let Some(handler) = handler else {
            tracing::debug!(tag = %tag, "no handler registered for tag");
            return Flow::Continue;
        };

        let delivery = Delivery {
            tag: tag.clone(),
            echoed_id,
            payload,
        };
        let outcome = AssertUnwindSafe(handler.handle(delivery)).catch_unwind().await;
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                let err = LinkError::Handler {
                    tag: tag.clone(),
                    message: e.to_string(),
                };
                tracing::warn!(error = %err, "handler failed");
                true
            }
            Err(_panic) => {
                let err = LinkError::Handler {
                    tag: tag.clone(),
                    message: "panicked".into(),
                };
                tracing::error!(error = %err, "handler panicked");
                true
            }
        };
        if failed && self.errors.record(ErrorCategory::Handler) {
            return Flow::End(SessionEnd::Forced);
        }
        Flow::Continue
    }

    /// Keepalive tick: probe the peer if healthy, otherwise reconnect.
    async fn on_keepalive(
        &mut self,
        socket: &mut Socket,
        drain_at: &mut Option<tokio::time::Instant>,
    ) -> Flow {
        if !self.probe.is_healthy() {
            tracing::warn!(silence = ?self.probe.silence(), "channel unhealthy, forcing reconnect");
            self.errors.record(ErrorCategory::Heartbeat);
            return Flow::End(SessionEnd::Forced);
        }
        // Health came back with messages still queued: resume draining.
        if drain_at.is_none() && !self.queue.is_empty() {
            *drain_at = Some(tokio::time::Instant::now());
        }
        let ping = ping_frame();
        self.send_control(socket, &ping).await
    }

    /// Coarse periodic maintenance: retention sweep plus the redundant
    /// silence check layered over the keepalive timer.
    fn on_maintenance(&mut self) -> Flow {
        self.tracker.sweep_acked(Instant::now());
        if self.probe.silent_past_cutoff() {
            tracing::warn!(silence = ?self.probe.silence(), "heartbeat timeout, forcing reconnect");
            self.errors.record(ErrorCategory::Heartbeat);
            return Flow::End(SessionEnd::Forced);
        }
        if !self.probe.is_healthy() {
            self.reporter.emit(LinkStatus::Unstable);
        }
        Flow::Continue
    }

    /// Expire pending acknowledgments past their individual deadlines.
    fn on_sweep(&mut self) -> Flow {
        let expired = self.tracker.expire(Instant::now());
        if expired.is_empty() {
            return Flow::Continue;
        }
        for id in &expired {
            tracing::warn!(error = %LinkError::MessageTimeout(*id), "delivery not acknowledged");
            if let Some(hook) = &self.cfg.on_timeout {
                hook(*id);
            }
        }
        if !self.probe.is_healthy() {
            return Flow::End(SessionEnd::Forced);
        }
        Flow::Continue
    }

    /// Dequeue and send one message, then re-arm the pacer.
    async fn on_drain(
        &mut self,
        socket: &mut Socket,
        drain_at: &mut Option<tokio::time::Instant>,
    ) -> Flow {
        if !self.probe.is_healthy() {
            // Health lost mid-drain: stop, leaving the rest queued.
            *drain_at = None;
            return Flow::Continue;
        }
        let Some(msg) = self.queue.pop_front() else {
            *drain_at = None;
            return Flow::Continue;
        };
        let flow = self.transmit(Envelope::new(msg.id, msg.payload), socket).await;
        *drain_at = if self.queue.is_empty() {
            None
        } else {
            Some(tokio::time::Instant::now() + self.pacer.delay())
        };
        flow
    }

    /// Keepalive frames bypass the envelope and the delivery tracker.
    async fn send_control(&mut self, socket: &mut Socket, frame: &Value) -> Flow {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize control frame");
                return Flow::Continue;
            }
        };
        if let Err(e) = socket.send(Message::Text(text)).await {
            let err = LinkError::Transmission(e.to_string());
            tracing::warn!(error = %err, "control frame send failed");
            return Flow::End(SessionEnd::Unclean {
                detail: err.to_string(),
            });
        }
        Flow::Continue
    }
}

async fn wait_until(at: Option<tokio::time::Instant>) {
    match at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
