//! Message sockets: connection management, routing and pattern state.

use super::codec;
use super::stream::{self, BoxStream, Listener};
use super::{Context, Endpoint, Frame, SocketEvent, SocketKind, TransportError};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// First frame of the greeting every dialer sends.
const GREETING_TAG: &[u8] = b"LVN1";

/// How many times a bind retries while a previous listener is releasing the address.
const BIND_ATTEMPTS: u32 = 20;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(25);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables for connection management.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// First redial delay after a failed dial or dropped connection
    pub reconnect_initial: Duration,
    /// Upper bound for the doubling redial delay
    pub reconnect_max: Duration,
    /// How long an accepted peer has to send its greeting
    pub handshake_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

struct PeerHandle {
    conn_id: u64,
    outbound: mpsc::UnboundedSender<Vec<Frame>>,
}

#[derive(Default)]
struct Peers {
    routes: HashMap<Vec<u8>, PeerHandle>,
    order: Vec<Vec<u8>>,
    next: usize,
}

/// Alternation state of request and reply sockets.
enum PatternState {
    Idle,
    AwaitingReply,
    Replying(Vec<u8>),
}

struct Incoming {
    route: Vec<u8>,
    frames: Vec<Frame>,
}

struct SocketShared {
    id: u64,
    kind: SocketKind,
    identity: Vec<u8>,
    ctx: Context,
    options: SocketOptions,
    cancel: CancellationToken,
    closed: AtomicBool,
    next_conn: AtomicU64,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    peers: Mutex<Peers>,
    monitor: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
    pattern: Mutex<PatternState>,
    endpoints: Mutex<Vec<String>>,
    inproc_bound: Mutex<Vec<(String, mpsc::UnboundedSender<DuplexStream>)>>,
}

impl SocketShared {
    fn emit(&self, event: SocketEvent) {
        tracing::trace!(socket = self.id, ?event, "Socket event");
        if let Some(tx) = lock(&self.monitor).as_ref() {
            // A dropped receiver just means nobody is listening any more.
            let _ = tx.send(event);
        }
    }

    fn greeting(&self) -> Vec<Frame> {
        vec![
            GREETING_TAG.to_vec(),
            self.kind.as_str().as_bytes().to_vec(),
            self.identity.clone(),
        ]
    }

    fn register_peer(&self, route: Vec<u8>, conn_id: u64) -> mpsc::UnboundedReceiver<Vec<Frame>> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let mut peers = lock(&self.peers);
        if peers
            .routes
            .insert(route.clone(), PeerHandle { conn_id, outbound })
            .is_none()
        {
            peers.order.push(route);
        }
        rx
    }

    fn unregister_peer(&self, route: &[u8], conn_id: u64) {
        let mut peers = lock(&self.peers);
        if peers.routes.get(route).is_some_and(|p| p.conn_id == conn_id) {
            peers.routes.remove(route);
            peers.order.retain(|r| r != route);
        }
    }

    fn send_round_robin(&self, mut frames: Vec<Frame>) -> Result<(), TransportError> {
        let mut peers = lock(&self.peers);
        for _ in 0..peers.order.len() {
            let idx = peers.next % peers.order.len();
            peers.next = peers.next.wrapping_add(1);
            let Some(peer) = peers.routes.get(&peers.order[idx]) else {
                continue;
            };
            match peer.outbound.send(frames) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(back)) => frames = back,
            }
        }
        Err(TransportError::NoPeer)
    }

    fn send_to(&self, route: &[u8], frames: Vec<Frame>) -> Result<(), TransportError> {
        let peers = lock(&self.peers);
        peers
            .routes
            .get(route)
            .and_then(|peer| peer.outbound.send(frames).ok())
            .ok_or_else(|| TransportError::UnknownRoute(String::from_utf8_lossy(route).into_owned()))
    }

    /// Apply the socket pattern to a received message. `None` drops it.
    fn accept_incoming(&self, incoming: Incoming) -> Option<Vec<Frame>> {
        let Incoming { route, mut frames } = incoming;
        match self.kind {
            SocketKind::Dealer => Some(frames),
            SocketKind::Router => {
                frames.insert(0, route);
                Some(frames)
            }
            SocketKind::Request => {
                let mut pattern = lock(&self.pattern);
                if !matches!(*pattern, PatternState::AwaitingReply) {
                    tracing::debug!(socket = self.id, "Dropping reply that arrived after its request was abandoned");
                    return None;
                }
                if frames.first().is_none_or(|f| !f.is_empty()) {
                    tracing::debug!(socket = self.id, "Dropping reply without delimiter");
                    return None;
                }
                frames.remove(0);
                *pattern = PatternState::Idle;
                Some(frames)
            }
            SocketKind::Reply => {
                if frames.first().is_none_or(|f| !f.is_empty()) {
                    tracing::debug!(socket = self.id, "Dropping request without delimiter");
                    return None;
                }
                frames.remove(0);
                *lock(&self.pattern) = PatternState::Replying(route);
                Some(frames)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }
}

/// Handle to a message socket. Clones share the same socket.
#[derive(Clone)]
pub struct MessageSocket {
    shared: Arc<SocketShared>,
}

impl MessageSocket {
    pub(crate) fn new(
        ctx: Context,
        kind: SocketKind,
        identity: Vec<u8>,
        options: SocketOptions,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let cancel = ctx.child_token();
        Self {
            shared: Arc::new(SocketShared {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                identity,
                ctx,
                options,
                cancel,
                closed: AtomicBool::new(false),
                next_conn: AtomicU64::new(1),
                incoming_tx,
                incoming_rx: tokio::sync::Mutex::new(incoming_rx),
                peers: Mutex::new(Peers::default()),
                monitor: Mutex::new(None),
                pattern: Mutex::new(PatternState::Idle),
                endpoints: Mutex::new(Vec::new()),
                inproc_bound: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Process-unique id of this socket; a recreated socket gets a new one.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> SocketKind {
        self.shared.kind
    }

    pub fn identity(&self) -> &[u8] {
        &self.shared.identity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Most recently connected or bound endpoint.
    pub fn last_endpoint(&self) -> Option<String> {
        lock(&self.shared.endpoints).last().cloned()
    }

    /// Number of currently established peer connections.
    pub fn peer_count(&self) -> usize {
        lock(&self.shared.peers).routes.len()
    }

    /// Register (or clear) the channel that receives connection events.
    pub fn set_monitor(&self, monitor: Option<mpsc::UnboundedSender<SocketEvent>>) {
        *lock(&self.shared.monitor) = monitor;
    }

    #[cfg(test)]
    pub(crate) fn emit_event(&self, event: SocketEvent) {
        self.shared.emit(event);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Start connecting to `endpoint` in the background.
    ///
    /// Returns once the endpoint is validated. The connection is redialed with
    /// exponential backoff whenever it fails or drops, until the socket closes.
    pub fn connect(&self, endpoint: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let parsed = Endpoint::parse(endpoint)?;
        lock(&self.shared.endpoints).push(endpoint.to_string());
        tokio::spawn(dial_loop(self.shared.clone(), parsed, endpoint.to_string()));
        Ok(())
    }

    /// Bind `endpoint` and start accepting peers. Returns the resolved endpoint.
    pub async fn bind(&self, endpoint: &str) -> Result<String, TransportError> {
        self.ensure_open()?;
        let parsed = Endpoint::parse(endpoint)?;

        let mut attempt = 1;
        let listener = loop {
            match Listener::bind(&self.shared.ctx, &parsed).await {
                Ok(listener) => break listener,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(source) => {
                    return Err(TransportError::Bind {
                        endpoint: endpoint.to_string(),
                        source,
                    });
                }
            }
        };

        let local = listener.local_endpoint()?;
        if let Some(registration) = listener.inproc_registration() {
            lock(&self.shared.inproc_bound).push(registration);
        }
        lock(&self.shared.endpoints).push(local.clone());
        tracing::debug!(socket = self.shared.id, "Listening on {}", local);
        self.shared.emit(SocketEvent::Listening {
            endpoint: local.clone(),
        });

        tokio::spawn(accept_loop(self.shared.clone(), listener, local.clone()));
        Ok(local)
    }

    /// Queue a message for sending. Never blocks.
    pub fn send(&self, frames: Vec<Frame>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let shared = &self.shared;
        match shared.kind {
            SocketKind::Dealer => shared.send_round_robin(frames),
            SocketKind::Router => {
                let mut frames = frames.into_iter();
                let route = frames.next().ok_or(TransportError::MissingRoute)?;
                shared.send_to(&route, frames.collect())
            }
            SocketKind::Request => {
                let mut pattern = lock(&shared.pattern);
                if !matches!(*pattern, PatternState::Idle) {
                    return Err(TransportError::InvalidState(
                        "request socket is still awaiting a reply",
                    ));
                }
                let mut message = Vec::with_capacity(frames.len() + 1);
                message.push(Vec::new());
                message.extend(frames);
                shared.send_round_robin(message)?;
                *pattern = PatternState::AwaitingReply;
                Ok(())
            }
            SocketKind::Reply => {
                let mut pattern = lock(&shared.pattern);
                let route = match std::mem::replace(&mut *pattern, PatternState::Idle) {
                    PatternState::Replying(route) => route,
                    other => {
                        *pattern = other;
                        return Err(TransportError::InvalidState(
                            "reply socket has no request to answer",
                        ));
                    }
                };
                let mut message = Vec::with_capacity(frames.len() + 1);
                message.push(Vec::new());
                message.extend(frames);
                match shared.send_to(&route, message) {
                    Err(TransportError::UnknownRoute(peer)) => {
                        tracing::debug!(socket = shared.id, "Requester {} left before the reply", peer);
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> Result<Vec<Frame>, TransportError> {
        self.ensure_open()?;
        let misuse = {
            let pattern = lock(&self.shared.pattern);
            match (self.shared.kind, &*pattern) {
                (SocketKind::Request, PatternState::Idle) => {
                    Some("request socket must send before receiving")
                }
                (SocketKind::Reply, PatternState::Replying(_)) => {
                    Some("reply socket must answer before receiving again")
                }
                _ => None,
            }
        };
        if let Some(reason) = misuse {
            return Err(TransportError::InvalidState(reason));
        }

        let mut rx = self.shared.incoming_rx.lock().await;
        loop {
            let incoming = tokio::select! {
                _ = self.shared.cancel.cancelled() => return Err(TransportError::Closed),
                msg = rx.recv() => msg.ok_or(TransportError::Closed)?,
            };
            if let Some(frames) = self.shared.accept_incoming(incoming) {
                return Ok(frames);
            }
        }
    }

    /// Like [`recv`](Self::recv), giving up after `timeout` with `Ok(None)`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<Frame>>, TransportError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Close the socket. Idempotent.
    ///
    /// Stops every connection task, withdraws inproc bindings and emits
    /// [`SocketEvent::Closed`]. Later sends and receives fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(socket = self.shared.id, kind = %self.shared.kind, "Closing socket");
        self.shared.cancel.cancel();
        {
            let mut peers = lock(&self.shared.peers);
            peers.routes.clear();
            peers.order.clear();
        }
        for (name, acceptor) in lock(&self.shared.inproc_bound).drain(..) {
            stream::unregister_inproc(&self.shared.ctx, &name, &acceptor);
        }
        self.shared.emit(SocketEvent::Closed);
    }
}

impl std::fmt::Debug for MessageSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSocket")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

async fn dial_loop(shared: Arc<SocketShared>, endpoint: Endpoint, name: String) {
    let mut delay = shared.options.reconnect_initial;
    loop {
        let dialed = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = stream::dial(&shared.ctx, &endpoint) => result,
        };

        match dialed {
            Ok(stream) => {
                let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
                let (reader, mut writer) = tokio::io::split(stream);
                if let Err(e) = codec::write_message(&mut writer, &shared.greeting()).await {
                    tracing::debug!(socket = shared.id, "Greeting to {} failed: {}", name, e);
                } else {
                    let route = name.as_bytes().to_vec();
                    let outbound = shared.register_peer(route.clone(), conn_id);
                    tracing::debug!(socket = shared.id, "Connected to {}", name);
                    shared.emit(SocketEvent::Connected {
                        endpoint: name.clone(),
                    });
                    delay = shared.options.reconnect_initial;

                    run_connection(&shared, reader, writer, outbound, &route).await;
                    shared.unregister_peer(&route, conn_id);

                    if shared.cancel.is_cancelled() {
                        break;
                    }
                    tracing::debug!(socket = shared.id, "Connection to {} dropped", name);
                    shared.emit(SocketEvent::Disconnected {
                        endpoint: name.clone(),
                    });
                }
            }
            Err(e) => {
                tracing::trace!(socket = shared.id, "Dial {} failed: {}", name, e);
            }
        }

        shared.emit(SocketEvent::ConnectRetried {
            endpoint: name.clone(),
            delay,
        });
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(shared.options.reconnect_max);
    }
}

async fn accept_loop(shared: Arc<SocketShared>, mut listener: Listener, endpoint: String) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = listener.accept() => result,
        };
        match accepted {
            Ok(stream) => {
                tokio::spawn(serve_peer(shared.clone(), stream, endpoint.clone()));
            }
            Err(e) => {
                tracing::warn!(socket = shared.id, "Accept on {} failed: {}", endpoint, e);
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.options.reconnect_initial) => {}
                }
            }
        }
    }
}

async fn serve_peer(shared: Arc<SocketShared>, stream: BoxStream, endpoint: String) {
    let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut reader, writer) = tokio::io::split(stream);

    let greeting = tokio::select! {
        _ = shared.cancel.cancelled() => return,
        result = tokio::time::timeout(
            shared.options.handshake_timeout,
            codec::read_message(&mut reader),
        ) => result,
    };
    let identity = match greeting {
        Ok(Ok(Some(frames))) if frames.len() == 3 && frames[0] == GREETING_TAG => {
            frames.into_iter().nth(2).unwrap_or_default()
        }
        Ok(Ok(_)) => {
            tracing::debug!(socket = shared.id, "Peer on {} sent an invalid greeting", endpoint);
            return;
        }
        Ok(Err(e)) => {
            tracing::debug!(socket = shared.id, "Peer on {} failed during greeting: {}", endpoint, e);
            return;
        }
        Err(_) => {
            tracing::debug!(socket = shared.id, "Peer on {} never sent a greeting", endpoint);
            return;
        }
    };

    let route = if identity.is_empty() {
        format!("peer-{}", conn_id).into_bytes()
    } else {
        identity
    };
    let peer = String::from_utf8_lossy(&route).into_owned();
    let outbound = shared.register_peer(route.clone(), conn_id);
    shared.emit(SocketEvent::Accepted {
        endpoint: endpoint.clone(),
        peer: peer.clone(),
    });

    run_connection(&shared, reader, writer, outbound, &route).await;
    shared.unregister_peer(&route, conn_id);

    if !shared.cancel.is_cancelled() {
        shared.emit(SocketEvent::PeerDisconnected { endpoint, peer });
    }
}

/// Pump frames both ways until either side fails, the peer is replaced, or
/// the socket closes.
async fn run_connection<S>(
    shared: &SocketShared,
    mut reader: ReadHalf<S>,
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Vec<Frame>>,
    route: &[u8],
) where
    S: AsyncRead + AsyncWrite,
{
    let read = async {
        loop {
            match codec::read_message(&mut reader).await {
                Ok(Some(frames)) => {
                    let incoming = Incoming {
                        route: route.to_vec(),
                        frames,
                    };
                    if shared.incoming_tx.send(incoming).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(socket = shared.id, "Read failed: {}", e);
                    break;
                }
            }
        }
    };

    let write = async {
        while let Some(frames) = outbound.recv().await {
            if let Err(e) = codec::write_message(&mut writer, &frames).await {
                tracing::debug!(socket = shared.id, "Write failed: {}", e);
                break;
            }
        }
    };

    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        _ = read => {}
        _ = write => {}
    }
}
