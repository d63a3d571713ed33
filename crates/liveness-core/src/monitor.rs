//! Socket monitor.
//!
//! Consumes the connection events of one socket on a background task and
//! exposes them as a thread-safe "is connected" predicate plus optional
//! callbacks. The monitored socket can be swapped for a fresh one through a
//! reset handshake:
//! 1. The resetting side raises the reset flag and wakes the event loop
//! 2. The event loop releases the event channel and parks until the reset ends
//! 3. The resetting side drains the old channel, registers on the new socket
//!    and lowers the flag
//!
//! No event of the new socket is missed, and no event of the old socket is
//! applied after the swap.

use crate::task::join_with_timeout;
use crate::transport::{MessageSocket, SocketEvent, Transition};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Default bound on a single wait for events.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Hooks fired on connection transitions.
///
/// Callbacks run while the monitor's state lock is held, so they must not call
/// back into the monitor.
#[derive(Clone, Default)]
pub struct MonitorCallbacks {
    pub on_connect: Option<Callback>,
    pub on_disconnect: Option<Callback>,
    pub on_closed: Option<Callback>,
}

impl MonitorCallbacks {
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    pub fn on_closed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Arc::new(f));
        self
    }
}

type EventChannel = Option<mpsc::UnboundedReceiver<SocketEvent>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct MonitorState {
    connected: bool,
    /// Set once the "closed" warning was logged for the current closed period
    closed_warned: bool,
}

struct MonitorShared {
    state: Mutex<MonitorState>,
    callbacks: MonitorCallbacks,
    /// Holding this lock is what entitles a party to consume or swap events
    events: Arc<tokio::sync::Mutex<EventChannel>>,
    socket: Mutex<MessageSocket>,
    resetting: AtomicBool,
    reset_requested: Notify,
    reset_done: Notify,
    generation: AtomicU64,
    poll_timeout: Duration,
}

impl MonitorShared {
    fn apply(&self, event: &SocketEvent) {
        let Some(transition) = event.transition() else {
            tracing::trace!(?event, "Socket event without liveness effect");
            return;
        };

        let mut state = lock(&self.state);
        let callback = match transition {
            Transition::Connected => {
                state.connected = true;
                state.closed_warned = false;
                &self.callbacks.on_connect
            }
            Transition::Disconnected => {
                state.connected = false;
                &self.callbacks.on_disconnect
            }
            Transition::Closed => {
                state.connected = false;
                if !state.closed_warned && !self.resetting.load(Ordering::SeqCst) {
                    tracing::warn!(
                        "Monitored socket was closed; reset_socket must be called before it is reused"
                    );
                    state.closed_warned = true;
                }
                &self.callbacks.on_closed
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    fn register(&self, socket: &MessageSocket) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        socket.set_monitor(Some(tx));
        rx
    }
}

/// Outcome of one wait in the event loop.
enum Step {
    Stop,
    Yield,
    Event(SocketEvent),
    ChannelClosed,
}

/// Watches the connection events of a socket.
pub struct SocketMonitor {
    shared: Arc<MonitorShared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    span: Span,
}

impl SocketMonitor {
    pub fn new(socket: MessageSocket, callbacks: MonitorCallbacks) -> Self {
        Self::with_poll_timeout(socket, callbacks, DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_poll_timeout(
        socket: MessageSocket,
        callbacks: MonitorCallbacks,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                state: Mutex::new(MonitorState::default()),
                callbacks,
                events: Arc::new(tokio::sync::Mutex::new(None)),
                socket: Mutex::new(socket),
                resetting: AtomicBool::new(false),
                reset_requested: Notify::new(),
                reset_done: Notify::new(),
                generation: AtomicU64::new(0),
                poll_timeout,
            }),
            task: Mutex::new(None),
            span: Span::current(),
        }
    }

    /// Attach a span the event loop is instrumented with.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Begin watching events. No-op while already running.
    pub async fn start(&self) {
        if self.is_running() {
            return;
        }

        {
            let mut events = self.shared.events.lock().await;
            if events.is_none() {
                let socket = lock(&self.shared.socket).clone();
                *events = Some(self.shared.register(&socket));
            }
        }

        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            event_loop(self.shared.clone(), cancel.clone()).instrument(self.span.clone()),
        );
        *task = Some((cancel, handle));
        tracing::debug!(parent: &self.span, "Socket monitor started");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).is_some()
    }

    /// Whether the most recent connection event said "connected".
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.state).connected
    }

    /// Number of completed socket resets.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Socket currently being watched.
    pub fn socket(&self) -> MessageSocket {
        lock(&self.shared.socket).clone()
    }

    /// Enter the reset handshake. The event loop is parked until the returned
    /// guard completes or is dropped.
    pub async fn begin_reset(&self) -> ResetGuard {
        self.shared.resetting.store(true, Ordering::SeqCst);
        self.shared.reset_requested.notify_one();
        let events = self.shared.events.clone().lock_owned().await;
        ResetGuard {
            shared: self.shared.clone(),
            events,
        }
    }

    /// Swap the watched socket for `socket`.
    pub async fn reset_socket(&self, socket: MessageSocket) {
        self.begin_reset().await.complete(socket);
    }

    /// Stop the event loop and unregister from the socket. Idempotent.
    pub async fn stop(&self) {
        let running = lock(&self.task).take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            join_with_timeout(handle, "Socket monitor").await;
            tracing::debug!(parent: &self.span, "Socket monitor stopped");
        }

        let mut events = self.shared.events.lock().await;
        if events.take().is_some() {
            lock(&self.shared.socket).set_monitor(None);
        }
    }
}

/// Exclusive access to the monitor's event channel during a socket swap.
pub struct ResetGuard {
    shared: Arc<MonitorShared>,
    events: OwnedMutexGuard<EventChannel>,
}

impl ResetGuard {
    /// Finish the swap: apply what the old socket still reported, then watch
    /// `socket`, which starts out disconnected.
    pub fn complete(mut self, socket: MessageSocket) {
        let had_channel = self.events.is_some();
        if let Some(rx) = self.events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                self.shared.apply(&event);
            }
        }

        let old = std::mem::replace(&mut *lock(&self.shared.socket), socket.clone());
        old.set_monitor(None);
        if had_channel {
            *self.events = Some(self.shared.register(&socket));
        }

        {
            let mut state = lock(&self.shared.state);
            state.connected = false;
            state.closed_warned = false;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, socket = socket.id(), "Monitor reset to new socket");
    }
}

impl Drop for ResetGuard {
    fn drop(&mut self) {
        self.shared.resetting.store(false, Ordering::SeqCst);
        self.shared.reset_done.notify_waiters();
    }
}

async fn event_loop(shared: Arc<MonitorShared>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        if shared.resetting.load(Ordering::SeqCst) {
            let done = shared.reset_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();
            if shared.resetting.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut done => {}
                }
            }
            continue;
        }

        let mut events = shared.events.lock().await;
        if events.is_none() {
            drop(events);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shared.reset_requested.notified() => {}
                _ = tokio::time::sleep(shared.poll_timeout) => {}
            }
            continue;
        }
        let Some(rx) = events.as_mut() else {
            continue;
        };
        let step = tokio::select! {
            _ = cancel.cancelled() => Step::Stop,
            _ = shared.reset_requested.notified() => Step::Yield,
            _ = tokio::time::sleep(shared.poll_timeout) => Step::Yield,
            event = rx.recv() => match event {
                Some(event) => Step::Event(event),
                None => Step::ChannelClosed,
            },
        };

        match step {
            Step::Stop => break,
            Step::Yield => {}
            Step::Event(event) => shared.apply(&event),
            Step::ChannelClosed => {
                tracing::debug!("Socket event channel closed");
                *events = None;
            }
        }
    }
}
