//! Framed multipart transport.
//!
//! Sockets exchange messages made of frames over TCP, Unix domain sockets or
//! in-process pipes. Each socket can report connection-level events to a
//! monitor channel, which is what [`crate::monitor::SocketMonitor`] consumes.
//!
//! Socket kinds mirror the request/reply and router/dealer patterns:
//! - `Dealer`: connects, sends frames as-is, round-robins across peers
//! - `Router`: binds, prefixes received messages with the peer's routing id
//! - `Request`: strict send→recv alternation with an empty delimiter frame
//! - `Reply`: strict recv→send alternation, replies to the last requester

pub mod codec;
mod endpoint;
mod socket;
mod stream;

pub use endpoint::Endpoint;
pub use socket::{MessageSocket, SocketOptions};

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A single opaque frame of a multipart message.
pub type Frame = Vec<u8>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Socket is closed")]
    Closed,

    #[error("Operation not valid in the current socket state: {0}")]
    InvalidState(&'static str),

    #[error("No connected peer to send to")]
    NoPeer,

    #[error("Unknown routing id '{0}'")]
    UnknownRoute(String),

    #[error("Router message is missing its routing frame")]
    MissingRoute,

    #[error("Messaging context has been terminated")]
    ContextTerminated,

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the socket that produced this error is unusable and has to be
    /// recreated before further traffic.
    pub fn is_socket_invalid(&self) -> bool {
        matches!(
            self,
            TransportError::Closed
                | TransportError::InvalidState(_)
                | TransportError::ContextTerminated
        )
    }
}

/// Socket pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Dealer,
    Router,
    Request,
    Reply,
}

impl SocketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketKind::Dealer => "dealer",
            SocketKind::Router => "router",
            SocketKind::Request => "request",
            SocketKind::Reply => "reply",
        }
    }
}

impl Display for SocketKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection-level notification emitted by a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// An outbound connection was established
    Connected { endpoint: String },
    /// A dial attempt failed or a connection dropped; retrying after `delay`
    ConnectRetried { endpoint: String, delay: Duration },
    /// The socket is bound and accepting connections
    Listening { endpoint: String },
    /// A peer connected to a bound endpoint
    Accepted { endpoint: String, peer: String },
    /// A peer of a bound endpoint went away
    PeerDisconnected { endpoint: String, peer: String },
    /// An outbound connection dropped
    Disconnected { endpoint: String },
    /// The socket was closed
    Closed,
}

/// How an event affects the socket-level liveness predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Disconnected,
    Closed,
}

impl SocketEvent {
    /// Per-peer events on a bound socket and retry notices leave the
    /// predicate untouched.
    pub fn transition(&self) -> Option<Transition> {
        match self {
            SocketEvent::Connected { .. } | SocketEvent::Listening { .. } => {
                Some(Transition::Connected)
            }
            SocketEvent::Disconnected { .. } => Some(Transition::Disconnected),
            SocketEvent::Closed => Some(Transition::Closed),
            SocketEvent::ConnectRetried { .. }
            | SocketEvent::Accepted { .. }
            | SocketEvent::PeerDisconnected { .. } => None,
        }
    }
}

type InprocRegistry = HashMap<String, mpsc::UnboundedSender<DuplexStream>>;

struct ContextInner {
    inproc: Mutex<InprocRegistry>,
    shutdown: CancellationToken,
}

/// Shared messaging context.
///
/// Owns the registry of in-process endpoints. Terminating the context closes
/// every socket created from it. Cloning yields another handle to the same
/// context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                inproc: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a socket of the given kind with a routing identity.
    pub fn socket(
        &self,
        kind: SocketKind,
        identity: impl Into<Vec<u8>>,
    ) -> Result<MessageSocket, TransportError> {
        self.socket_with_options(kind, identity, SocketOptions::default())
    }

    pub fn socket_with_options(
        &self,
        kind: SocketKind,
        identity: impl Into<Vec<u8>>,
        options: SocketOptions,
    ) -> Result<MessageSocket, TransportError> {
        if self.is_terminated() {
            return Err(TransportError::ContextTerminated);
        }
        Ok(MessageSocket::new(self.clone(), kind, identity.into(), options))
    }

    /// Close every socket created from this context. Idempotent.
    pub fn terminate(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::debug!("Terminating messaging context");
            self.inner.shutdown.cancel();
        }
        self.inproc_registry().clear();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    pub(crate) fn inproc_registry(&self) -> std::sync::MutexGuard<'_, InprocRegistry> {
        self.inner
            .inproc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_mapping() {
        let connected = SocketEvent::Connected {
            endpoint: "inproc://a".into(),
        };
        let listening = SocketEvent::Listening {
            endpoint: "inproc://a".into(),
        };
        let accepted = SocketEvent::Accepted {
            endpoint: "inproc://a".into(),
            peer: "w1".into(),
        };
        assert_eq!(connected.transition(), Some(Transition::Connected));
        assert_eq!(listening.transition(), Some(Transition::Connected));
        assert_eq!(accepted.transition(), None);
        assert_eq!(SocketEvent::Closed.transition(), Some(Transition::Closed));
    }

    #[test]
    fn test_socket_invalid_classification() {
        assert!(TransportError::Closed.is_socket_invalid());
        assert!(TransportError::InvalidState("x").is_socket_invalid());
        assert!(!TransportError::NoPeer.is_socket_invalid());
    }

    #[tokio::test]
    async fn test_terminated_context_refuses_sockets() {
        let ctx = Context::new();
        ctx.terminate();
        assert!(matches!(
            ctx.socket(SocketKind::Dealer, "id"),
            Err(TransportError::ContextTerminated)
        ));
    }
}
