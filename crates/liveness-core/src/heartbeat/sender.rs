//! Heartbeat sender: announces this node's liveness on a fixed cadence.

use super::{HeartbeatConfig, HeartbeatPayload};
use crate::clock::now_ms;
use crate::descriptor::LinkMode;
use crate::envelope::{EventKind, create_message};
use crate::error::{LivenessError, Result};
use crate::identity::{NodeIdentity, NodeRole};
use crate::lifecycle::{NodeOptions, NodeSocket};
use crate::task::join_with_timeout;
use crate::transport::{Context, SocketKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

type Running = Option<(CancellationToken, JoinHandle<()>)>;

/// Periodically sends `heartbeat` envelopes over a dealer link.
pub struct HeartbeatSender {
    ctx: Context,
    config: HeartbeatConfig,
    identity: NodeIdentity,
    node_type: NodeRole,
    options: NodeOptions,
    span: Span,
    sent: Arc<AtomicU64>,
    task: Mutex<Running>,
}

impl HeartbeatSender {
    pub fn new(
        ctx: Context,
        config: HeartbeatConfig,
        identity: NodeIdentity,
        node_type: NodeRole,
        options: NodeOptions,
        span: Span,
    ) -> Self {
        Self {
            ctx,
            config,
            identity,
            node_type,
            options,
            span,
            sent: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Running> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Heartbeats handed to the transport so far.
    pub fn heartbeats_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task().is_some()
    }

    /// Spawn the send loop. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task();
        if task.is_some() {
            return Ok(());
        }

        let link = NodeSocket::link(
            self.ctx.clone(),
            SocketKind::Dealer,
            LinkMode::Connect,
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
                self.config.clone(),
                self.identity.clone(),
                self.node_type,
                self.sent.clone(),
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
            join_with_timeout(handle, "Heartbeat sender").await;
        }
    }
}

async fn run(
    link: NodeSocket,
    config: HeartbeatConfig,
    identity: NodeIdentity,
    node_type: NodeRole,
    sent: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    tracing::info!(
        "Heartbeat sender starting: {} every {:?}",
        link.connection_string(),
        config.interval
    );

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = link.connect() => match result {
            Ok(true) => tracing::debug!("Heartbeat link connected"),
            Ok(false) => tracing::debug!("Heartbeat link not connected yet"),
            Err(e) => {
                tracing::warn!("Heartbeat link failed to connect: {}", e);
                reinitialize(&link).await;
            }
        },
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }

        if !link.is_attached() {
            let attached = tokio::select! {
                _ = cancel.cancelled() => break,
                result = link.connect() => result,
            };
            if let Err(e) = attached {
                tracing::warn!("Heartbeat link failed to connect: {}", e);
                reinitialize(&link).await;
                continue;
            }
        }

        if !link.is_connected() {
            tracing::debug!("Heartbeat link disconnected; skipping this beat");
            continue;
        }

        let payload = HeartbeatPayload::new(&identity, node_type, now_ms());
        let frames = match create_message(&EventKind::Heartbeat, &payload, true) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!("Failed to encode heartbeat: {}", e);
                continue;
            }
        };

        match link.send(frames).await {
            Ok(()) => {
                let total = sent.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(total, "Heartbeat sent");
            }
            // The link already recreated its socket; the next beat reconnects.
            Err(LivenessError::SocketInvalid(e)) => {
                tracing::debug!("Heartbeat socket was invalid: {}", e);
            }
            Err(e) => {
                tracing::warn!("Failed to send heartbeat: {}", e);
                reinitialize(&link).await;
            }
        }
    }

    link.cleanup().await;
    tracing::info!("Heartbeat sender stopped");
}

async fn reinitialize(link: &NodeSocket) {
    if let Err(e) = link.reinitialize_socket().await {
        tracing::error!("Failed to reinitialize heartbeat socket: {}", e);
    }
}
