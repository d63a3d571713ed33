//! liveness-core: node liveness and connection resilience for message-oriented peer links.
//!
//! This crate provides:
//! - A framed multipart transport with dealer/router/request/reply sockets
//! - A socket monitor that turns connection events into an "is connected" predicate
//! - A socket lifecycle manager that recreates sockets when they become unusable
//! - A heartbeat sender and receiver with missed-heartbeat eviction

pub mod clock;
pub mod descriptor;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod lifecycle;
pub mod monitor;
mod task;
pub mod transport;

pub use descriptor::{ConnectionDescriptor, DescriptorError, LinkMode, TransportKind};
pub use envelope::{Envelope, EnvelopeError, EventKind, create_message, parse_message};
pub use error::{LivenessError, Result};
pub use heartbeat::{
    Heartbeat, HeartbeatConfig, HeartbeatPayload, HeartbeatReceiver, HeartbeatRecord,
    HeartbeatSender, LivenessEvent, NodeRegistry,
};
pub use identity::{IdentityError, IdentityStore, NodeIdentity, NodeRole};
pub use lifecycle::{NodeConfig, NodeOptions, NodeSocket, RetryPolicy, SocketStatus};
pub use monitor::{MonitorCallbacks, SocketMonitor};
pub use transport::{Context, Frame, MessageSocket, SocketEvent, SocketKind, TransportError};
