//! Heartbeat receiver: ingests heartbeats from many senders and sweeps for
//! silent ones.

use super::{HeartbeatConfig, HeartbeatOutcome, HeartbeatPayload, HeartbeatRecord, LivenessEvent, NodeRegistry};
use crate::clock::now_ms;
use crate::descriptor::LinkMode;
use crate::envelope::{EventKind, parse_message};
use crate::error::Result;
use crate::identity::NodeIdentity;
use crate::lifecycle::{NodeOptions, NodeSocket};
use crate::task::join_with_timeout;
use crate::transport::{Context, Frame, SocketKind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Capacity of the liveness event channel; slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 256;

/// Pause before retrying after the link failed outright.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(1);

type Running = Option<(CancellationToken, JoinHandle<()>)>;

/// Binds a router link and tracks every sender it hears from.
pub struct HeartbeatReceiver {
    ctx: Context,
    config: HeartbeatConfig,
    identity: NodeIdentity,
    options: NodeOptions,
    span: Span,
    registry: Arc<NodeRegistry>,
    events: broadcast::Sender<LivenessEvent>,
    task: Mutex<Running>,
}

impl HeartbeatReceiver {
    pub fn new(
        ctx: Context,
        config: HeartbeatConfig,
        identity: NodeIdentity,
        options: NodeOptions,
        span: Span,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new(config.timeout_ms(), config.max_missed));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ctx,
            config,
            identity,
            options,
            span,
            registry,
            events,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Running> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Read-only copy of the tracked records.
    pub fn snapshot(&self) -> Vec<HeartbeatRecord> {
        self.registry.snapshot()
    }

    /// Join and eviction notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task().is_some()
    }

    /// Spawn the receive loop. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task();
        if task.is_some() {
            return Ok(());
        }

        let link = NodeSocket::link(
            self.ctx.clone(),
            SocketKind::Router,
            LinkMode::Bind,
            self.config.connection.clone(),
            self.identity.clone(),
            self.options.clone(),
            &self.span,
        )?;
        let span = link.span().clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            run(
                link,
                self.config.interval,
                self.registry.clone(),
                self.events.clone(),
                cancel.clone(),
            )
            .instrument(span),
        );
        *task = Some((cancel, handle));
        Ok(())
    }

    /// Stop the loop and wait for it to release its link. Idempotent.
    pub async fn stop(&self) {
        let running = self.task().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            join_with_timeout(handle, "Heartbeat receiver").await;
        }
    }
}

async fn run(
    link: NodeSocket,
    interval: Duration,
    registry: Arc<NodeRegistry>,
    events: broadcast::Sender<LivenessEvent>,
    cancel: CancellationToken,
) {
    tracing::info!("Heartbeat receiver starting on {}", link.connection_string());

    let error_backoff = interval.min(MAX_ERROR_BACKOFF);
    let mut next_sweep = Instant::now() + interval;

    while !cancel.is_cancelled() {
        // Unbound after a failed bind or a socket reinit; nothing arrives
        // until the link is attached again.
        if !link.is_attached() {
            let bound = tokio::select! {
                _ = cancel.cancelled() => break,
                result = link.connect() => result,
            };
            match bound {
                Ok(_) => tracing::debug!("Heartbeat receiver bound {}", link.connection_string()),
                Err(e) => {
                    tracing::warn!("Heartbeat receiver failed to bind: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(error_backoff) => {}
                    }
                    sweep_if_due(&mut next_sweep, interval, &registry, &events);
                    continue;
                }
            }
        }

        let wait = next_sweep.saturating_duration_since(Instant::now());
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            result = link.recv_timeout(wait) => result,
        };

        match received {
            Ok(Some(frames)) => handle_frames(&frames, &registry, &events),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Heartbeat receive failed: {}", e);
                let rebound = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = link.connect() => result,
                };
                if let Err(e) = rebound {
                    tracing::warn!("Heartbeat receiver failed to rebind: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(error_backoff) => {}
                    }
                }
            }
        }

        sweep_if_due(&mut next_sweep, interval, &registry, &events);
    }

    link.cleanup().await;
    tracing::info!("Heartbeat receiver stopped");
}

/// Sweep the registry once `next_sweep` has passed and announce evictions.
fn sweep_if_due(
    next_sweep: &mut Instant,
    interval: Duration,
    registry: &NodeRegistry,
    events: &broadcast::Sender<LivenessEvent>,
) {
    if Instant::now() < *next_sweep {
        return;
    }
    for record in registry.check_missed_heartbeats(now_ms()) {
        // No subscribers is fine.
        let _ = events.send(LivenessEvent::NodeEvicted {
            identity: record.identity,
            last_heartbeat: record.last_heartbeat,
            missed_count: record.missed_count,
        });
    }
    *next_sweep = Instant::now() + interval;
}

/// Apply one received message. Anything malformed is logged and dropped.
fn handle_frames(
    frames: &[Frame],
    registry: &NodeRegistry,
    events: &broadcast::Sender<LivenessEvent>,
) {
    let envelope = match parse_message(frames) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Dropping malformed heartbeat message: {}", e);
            return;
        }
    };

    match &envelope.event {
        EventKind::Heartbeat => {}
        other => {
            tracing::debug!("Ignoring '{}' event on the heartbeat link", other);
            return;
        }
    }

    let payload: HeartbeatPayload = match envelope.decode() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Dropping heartbeat with invalid payload: {}", e);
            return;
        }
    };
    let identity = match payload.identity() {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!("Dropping heartbeat with invalid identity: {}", e);
            return;
        }
    };

    if registry.handle_heartbeat(identity.clone(), now_ms()) == HeartbeatOutcome::FirstContact {
        let _ = events.send(LivenessEvent::NodeJoined {
            identity,
            node_type: payload.node_type,
        });
    }
}
