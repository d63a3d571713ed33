//! Socket lifecycle manager.
//!
//! A [`NodeSocket`] owns exactly one live socket, the monitor watching it and
//! the node's heartbeat component. Status changes only come from monitor
//! callbacks or from explicit teardown:
//!
//! ```text
//! Closed --connect--> Connected --peer drop--> Disconnected --peer back--> Connected
//!    ^                                                                        |
//!    +------------------------- close / cleanup / reinit ---------------------+
//! ```
//!
//! When the socket becomes unusable it is closed and recreated with the same
//! identity, and the monitor is moved to the new socket inside its reset
//! handshake.

use crate::descriptor::{ConnectionDescriptor, LinkMode};
use crate::envelope::{Envelope, EventKind, create_message, parse_message};
use crate::error::{LivenessError, Result};
use crate::heartbeat::{
    Heartbeat, HeartbeatConfig, HeartbeatReceiver, HeartbeatRole, HeartbeatSender,
};
use crate::identity::{NodeIdentity, NodeRole};
use crate::monitor::{MonitorCallbacks, SocketMonitor};
use crate::transport::{Context, Frame, MessageSocket, SocketKind, TransportError};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Instrument, Span};

/// Link status as last reported by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketStatus {
    Closed,
    Connected,
    Disconnected,
}

impl Display for SocketStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SocketStatus::Closed => "closed",
            SocketStatus::Connected => "connected",
            SocketStatus::Disconnected => "disconnected",
        })
    }
}

/// Retry budget for connecting and for request/reply round trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a typed error is surfaced (default: 3)
    pub attempts: u32,
    /// Pause between connection attempts (default: 1s)
    pub retry_timeout: Duration,
    /// How long to wait for a reply (default: 5s)
    pub reply_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    /// How long `connect()` waits for the monitor to report a connection (default: 2s)
    pub connect_timeout: Duration,
    /// Monitor poll bound (default: 500ms)
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            poll_timeout: crate::monitor::DEFAULT_POLL_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything needed to build a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub connection: ConnectionDescriptor,
    pub heartbeat: Option<HeartbeatConfig>,
    pub options: NodeOptions,
}

impl NodeConfig {
    pub fn new(role: NodeRole, connection: ConnectionDescriptor) -> Self {
        Self {
            role,
            connection,
            heartbeat: None,
            options: NodeOptions::default(),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of a node's socket, monitor and heartbeat.
pub struct NodeSocket {
    ctx: Context,
    /// Terminate the context on cleanup
    owns_ctx: bool,
    kind: SocketKind,
    mode: LinkMode,
    role: Option<NodeRole>,
    descriptor: ConnectionDescriptor,
    identity: NodeIdentity,
    socket_identity: Vec<u8>,
    socket: Mutex<MessageSocket>,
    /// Whether the current socket was bound or connected
    attached: AtomicBool,
    monitor: SocketMonitor,
    status: Arc<watch::Sender<SocketStatus>>,
    heartbeat: Option<Heartbeat>,
    heartbeat_started: AtomicBool,
    reinit: tokio::sync::Mutex<()>,
    options: NodeOptions,
    span: Span,
}

impl NodeSocket {
    /// Build a node with its own messaging context.
    pub fn new(config: NodeConfig, identity: NodeIdentity) -> Result<Self> {
        let mut node = Self::with_context(Context::new(), config, identity)?;
        node.owns_ctx = true;
        Ok(node)
    }

    /// Build a node on a shared messaging context.
    pub fn with_context(ctx: Context, config: NodeConfig, identity: NodeIdentity) -> Result<Self> {
        let NodeConfig {
            role,
            connection,
            heartbeat,
            options,
        } = config;

        let span = tracing::info_span!(
            "node",
            node_id = %identity.node_id,
            session_id = %identity.session_id,
            role = %role
        );

        let heartbeat = match heartbeat {
            Some(hb) => {
                hb.validate()?;
                let component = match role.heartbeat_role() {
                    HeartbeatRole::Sender => Heartbeat::Sender(HeartbeatSender::new(
                        ctx.clone(),
                        hb,
                        identity.clone(),
                        role,
                        options.clone(),
                        span.clone(),
                    )),
                    HeartbeatRole::Receiver => Heartbeat::Receiver(HeartbeatReceiver::new(
                        ctx.clone(),
                        hb,
                        identity.clone(),
                        options.clone(),
                        span.clone(),
                    )),
                };
                Some(component)
            }
            None => None,
        };

        let socket_identity = identity.node_id.as_bytes().to_vec();
        Self::build(
            ctx,
            role.socket_kind(),
            role.link_mode(),
            Some(role),
            connection,
            identity,
            socket_identity,
            heartbeat,
            options,
            span,
        )
    }

    /// Bare link for a heartbeat component: no role, no heartbeat of its own.
    pub(crate) fn link(
        ctx: Context,
        kind: SocketKind,
        mode: LinkMode,
        descriptor: ConnectionDescriptor,
        identity: NodeIdentity,
        options: NodeOptions,
        parent: &Span,
    ) -> Result<Self> {
        let span = tracing::debug_span!(parent: parent, "heartbeat_link", kind = %kind);
        let socket_identity = identity.registry_key().into_bytes();
        Self::build(
            ctx,
            kind,
            mode,
            None,
            descriptor,
            identity,
            socket_identity,
            None,
            options,
            span,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        ctx: Context,
        kind: SocketKind,
        mode: LinkMode,
        role: Option<NodeRole>,
        descriptor: ConnectionDescriptor,
        identity: NodeIdentity,
        socket_identity: Vec<u8>,
        heartbeat: Option<Heartbeat>,
        options: NodeOptions,
        span: Span,
    ) -> Result<Self> {
        let socket = ctx.socket(kind, socket_identity.clone())?;
        let status = Arc::new(watch::Sender::new(SocketStatus::Closed));

        let callbacks = {
            let on_connect = status.clone();
            let on_disconnect = status.clone();
            let on_closed = status.clone();
            MonitorCallbacks::default()
                .on_connect(move || {
                    tracing::debug!("Socket connected");
                    on_connect.send_replace(SocketStatus::Connected);
                })
                .on_disconnect(move || {
                    tracing::info!("Socket disconnected");
                    on_disconnect.send_replace(SocketStatus::Disconnected);
                })
                .on_closed(move || {
                    tracing::debug!("Socket closed");
                    on_closed.send_replace(SocketStatus::Closed);
                })
        };
        let monitor = SocketMonitor::with_poll_timeout(socket.clone(), callbacks, options.poll_timeout)
            .with_span(span.clone());

        Ok(Self {
            ctx,
            owns_ctx: false,
            kind,
            mode,
            role,
            descriptor,
            identity,
            socket_identity,
            socket: Mutex::new(socket),
            attached: AtomicBool::new(false),
            monitor,
            status,
            heartbeat,
            heartbeat_started: AtomicBool::new(false),
            reinit: tokio::sync::Mutex::new(()),
            options,
            span,
        })
    }

    /// Establish the link and wait up to `connect_timeout` for the monitor to
    /// report it. Returns `false` on timeout, leaving the status untouched.
    ///
    /// Starts the monitor before attaching, and the heartbeat component once.
    pub async fn connect(&self) -> Result<bool> {
        self.connect_inner().instrument(self.span.clone()).await
    }

    async fn connect_inner(&self) -> Result<bool> {
        if self.socket().is_closed() {
            self.reinitialize_inner().await?;
        }

        self.monitor.start().await;
        self.attach().await?;
        self.start_heartbeat()?;

        let connected = self.wait_for_connected(self.options.connect_timeout).await;
        if !connected {
            tracing::debug!(
                "Not connected to {} after {:?} (status: {})",
                self.connection_string(),
                self.options.connect_timeout,
                self.status()
            );
        }
        Ok(connected)
    }

    async fn attach(&self) -> Result<()> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let endpoint = self.connection_string();
        let socket = self.socket();
        let result = match self.mode {
            LinkMode::Bind => socket.bind(&endpoint).await.map(|local| {
                tracing::debug!("Bound {}", local);
            }),
            LinkMode::Connect => socket.connect(&endpoint).map(|()| {
                tracing::debug!("Connecting to {}", endpoint);
            }),
        };
        if let Err(e) = result {
            self.attached.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    fn start_heartbeat(&self) -> Result<()> {
        let Some(heartbeat) = &self.heartbeat else {
            return Ok(());
        };
        if self.heartbeat_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = heartbeat.start() {
            self.heartbeat_started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Wait until the status is `Connected`.
    pub async fn wait_for_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.status.subscribe();
        let wait = rx.wait_for(|status| *status == SocketStatus::Connected);
        matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)))
    }

    /// Close the current socket and replace it with a new one carrying the
    /// same identity. The new socket is not attached until the next `connect()`.
    pub async fn reinitialize_socket(&self) -> Result<()> {
        self.reinitialize_inner().instrument(self.span.clone()).await
    }

    async fn reinitialize_inner(&self) -> Result<()> {
        let _serial = self.reinit.lock().await;
        let guard = self.monitor.begin_reset().await;

        let old = self.socket();
        old.close();
        let fresh = self.ctx.socket(self.kind, self.socket_identity.clone())?;
        *lock(&self.socket) = fresh.clone();
        self.attached.store(false, Ordering::SeqCst);
        guard.complete(fresh.clone());

        tracing::info!(old = old.id(), new = fresh.id(), "Socket reinitialized");
        Ok(())
    }

    /// Connect, retrying with the policy's pause until the budget is spent.
    pub async fn reconnect(&self) -> Result<()> {
        let retry = &self.options.retry;
        let attempts = retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::debug!(parent: &self.span, "Connect attempt {}/{} timed out", attempt, attempts);
                }
                Err(e) => {
                    tracing::warn!(parent: &self.span, "Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    if matches!(e, LivenessError::Config(_) | LivenessError::Descriptor(_)) {
                        return Err(e);
                    }
                }
            }
            if attempt < attempts {
                tokio::time::sleep(retry.retry_timeout).await;
            }
        }
        Err(LivenessError::Connection {
            endpoint: self.connection_string(),
            attempts,
        })
    }

    async fn recover<T>(&self, err: TransportError) -> Result<T> {
        if err.is_socket_invalid() {
            tracing::warn!(parent: &self.span, "Socket unusable ({}); reinitializing", err);
            self.reinitialize_socket().await?;
            Err(LivenessError::SocketInvalid(err))
        } else {
            Err(err.into())
        }
    }

    /// Send raw frames. An unusable socket is recreated and reported as
    /// [`LivenessError::SocketInvalid`].
    pub async fn send(&self, frames: Vec<Frame>) -> Result<()> {
        match self.socket().send(frames) {
            Ok(()) => Ok(()),
            Err(e) => self.recover(e).await,
        }
    }

    /// Encode and send an event.
    pub async fn send_event<T: Serialize + ?Sized>(
        &self,
        event: &EventKind,
        data: &T,
        include_empty_frame: bool,
    ) -> Result<()> {
        let frames = create_message(event, data, include_empty_frame)?;
        self.send(frames).await
    }

    /// Receive raw frames, waiting at most `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<Frame>>> {
        match self.socket().recv_timeout(timeout).await {
            Ok(frames) => Ok(frames),
            Err(e) => self.recover(e).await,
        }
    }

    /// Send a request and wait for its reply within the retry budget.
    ///
    /// A reply timeout recreates the socket, since a request socket waiting
    /// for a lost reply cannot send again.
    pub async fn request<T: Serialize + ?Sized>(&self, event: &EventKind, data: &T) -> Result<Envelope> {
        let frames = create_message(event, data, false)?;
        let retry = self.options.retry.clone();
        let attempts = retry.attempts.max(1);

        for attempt in 1..=attempts {
            if !self.is_connected() {
                self.reconnect().await?;
            }

            match self.send(frames.clone()).await {
                Ok(()) => {}
                Err(LivenessError::SocketInvalid(e)) => {
                    tracing::debug!(parent: &self.span, "Attempt {}/{}: socket was invalid ({})", attempt, attempts, e);
                    continue;
                }
                Err(LivenessError::Transport(e)) => {
                    tracing::debug!(parent: &self.span, "Attempt {}/{}: send failed ({})", attempt, attempts, e);
                    tokio::time::sleep(retry.retry_timeout).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self.recv_timeout(retry.reply_timeout).await {
                Ok(Some(reply)) => return Ok(parse_message(&reply)?),
                Ok(None) => {
                    tracing::warn!(
                        parent: &self.span,
                        "No reply within {:?} (attempt {}/{})",
                        retry.reply_timeout,
                        attempt,
                        attempts
                    );
                    self.reinitialize_socket().await?;
                }
                Err(LivenessError::SocketInvalid(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Err(LivenessError::Timeout {
            endpoint: self.connection_string(),
            attempts,
        })
    }

    /// Tear everything down: monitor, heartbeat, socket, then the context if
    /// this node owns it. Idempotent.
    pub async fn cleanup(&self) {
        async {
            self.monitor.stop().await;
            if let Some(heartbeat) = &self.heartbeat {
                heartbeat.stop().await;
            }
            self.socket().close();
            self.status.send_replace(SocketStatus::Closed);
            if self.owns_ctx {
                self.ctx.terminate();
            }
            tracing::debug!("Node cleaned up");
        }
        .instrument(self.span.clone())
        .await
    }

    /// Log who this node is and where it talks.
    pub fn log_details(&self) {
        let _enter = self.span.enter();
        tracing::info!(
            node_id = %self.identity.node_id,
            session_id = %self.identity.session_id,
            role = %self.role.map(|r| r.as_str()).unwrap_or("link"),
            socket = %self.kind,
            endpoint = %self.connection_string(),
            "Node details"
        );
        if let Some(heartbeat) = &self.heartbeat {
            match heartbeat {
                Heartbeat::Sender(sender) => {
                    let config = sender.config();
                    tracing::info!(
                        "Heartbeat sender to {} every {:?}",
                        config.connection.connection_string(LinkMode::Connect),
                        config.interval
                    );
                }
                Heartbeat::Receiver(receiver) => {
                    let config = receiver.config();
                    tracing::info!(
                        "Heartbeat receiver on {} (interval {:?}, timeout {:?}, max missed {})",
                        config.connection.connection_string(LinkMode::Bind),
                        config.interval,
                        config.timeout,
                        config.max_missed
                    );
                }
            }
        }
    }

    pub fn connection_string(&self) -> String {
        self.descriptor.connection_string(self.mode)
    }

    pub fn status(&self) -> SocketStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SocketStatus> {
        self.status.subscribe()
    }

    /// The monitor's connected predicate.
    pub fn is_connected(&self) -> bool {
        self.monitor.is_connected()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Handle to the current socket. Becomes stale after a reinit.
    pub fn socket(&self) -> MessageSocket {
        lock(&self.socket).clone()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn role(&self) -> Option<NodeRole> {
        self.role
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn monitor(&self) -> &SocketMonitor {
        &self.monitor
    }

    pub fn heartbeat(&self) -> Option<&Heartbeat> {
        self.heartbeat.as_ref()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
