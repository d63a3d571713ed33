//! Heartbeat protocol.
//!
//! Connecting nodes run a [`HeartbeatSender`] that announces liveness on a
//! dedicated dealer link. Binding nodes run a [`HeartbeatReceiver`] that keeps a
//! [`NodeRegistry`] of every sender and evicts senders that stay silent for
//! more than `max_missed` sweeps past the timeout.

mod receiver;
mod registry;
mod sender;

pub use receiver::HeartbeatReceiver;
pub use registry::{HeartbeatOutcome, HeartbeatRecord, NodeRegistry};
pub use sender::HeartbeatSender;

use crate::descriptor::ConnectionDescriptor;
use crate::error::{LivenessError, Result};
use crate::identity::{IdentityError, NodeIdentity, NodeRole};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Heartbeat settings for one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Endpoint of the heartbeat link (separate from the node's main socket)
    pub connection: ConnectionDescriptor,
    /// Time between heartbeats, and between registry sweeps (default: 10s)
    pub interval: Duration,
    /// Silence after which a sweep counts a miss (default: 30s)
    pub timeout: Duration,
    /// Misses tolerated before eviction (default: 3)
    pub max_missed: u32,
}

impl HeartbeatConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_MISSED: u32 = 3;
    /// Longest accepted interval. Sweep deadlines are computed from it.
    pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(connection: ConnectionDescriptor) -> Self {
        Self {
            connection,
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            max_missed: Self::DEFAULT_MAX_MISSED,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_missed(mut self, max_missed: u32) -> Self {
        self.max_missed = max_missed;
        self
    }

    /// Reject settings that cannot work. A timeout shorter than the interval
    /// is allowed but produces a miss on nearly every sweep.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(LivenessError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.interval > Self::MAX_INTERVAL {
            return Err(LivenessError::Config(format!(
                "heartbeat interval {:?} exceeds the maximum of {:?}",
                self.interval,
                Self::MAX_INTERVAL
            )));
        }
        if self.max_missed == 0 {
            return Err(LivenessError::Config(
                "heartbeat max_missed must be at least 1".to_string(),
            ));
        }
        if self.timeout < self.interval {
            tracing::warn!(
                "Heartbeat timeout {:?} is shorter than the interval {:?}",
                self.timeout,
                self.interval
            );
        }
        Ok(())
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Which side of the heartbeat protocol a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatRole {
    Sender,
    Receiver,
}

/// Body of a `heartbeat` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub session_id: String,
    pub node_type: NodeRole,
    /// Sender's clock when the heartbeat was built (ms since epoch)
    pub last_heartbeat: u64,
    #[serde(default)]
    pub missed_count: u32,
}

impl HeartbeatPayload {
    pub fn new(identity: &NodeIdentity, node_type: NodeRole, now_ms: u64) -> Self {
        Self {
            node_id: identity.node_id.clone(),
            session_id: identity.session_id.clone(),
            node_type,
            last_heartbeat: now_ms,
            missed_count: 0,
        }
    }

    pub fn identity(&self) -> std::result::Result<NodeIdentity, IdentityError> {
        NodeIdentity::new(self.node_id.clone(), self.session_id.clone())
    }
}

/// Registry change published by a [`HeartbeatReceiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    /// First heartbeat from an identity
    NodeJoined {
        identity: NodeIdentity,
        node_type: NodeRole,
    },
    /// Identity removed after too many missed heartbeats
    NodeEvicted {
        identity: NodeIdentity,
        last_heartbeat: u64,
        missed_count: u32,
    },
}

/// Heartbeat component attached to a node.
pub enum Heartbeat {
    Sender(HeartbeatSender),
    Receiver(HeartbeatReceiver),
}

impl Heartbeat {
    /// Start the background task. Idempotent.
    pub fn start(&self) -> Result<()> {
        match self {
            Heartbeat::Sender(sender) => sender.start(),
            Heartbeat::Receiver(receiver) => receiver.start(),
        }
    }

    /// Stop the background task and release its link. Idempotent.
    pub async fn stop(&self) {
        match self {
            Heartbeat::Sender(sender) => sender.stop().await,
            Heartbeat::Receiver(receiver) => receiver.stop().await,
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Heartbeat::Sender(sender) => sender.is_running(),
            Heartbeat::Receiver(receiver) => receiver.is_running(),
        }
    }

    pub fn role(&self) -> HeartbeatRole {
        match self {
            Heartbeat::Sender(_) => HeartbeatRole::Sender,
            Heartbeat::Receiver(_) => HeartbeatRole::Receiver,
        }
    }

    pub fn as_sender(&self) -> Option<&HeartbeatSender> {
        match self {
            Heartbeat::Sender(sender) => Some(sender),
            Heartbeat::Receiver(_) => None,
        }
    }

    pub fn as_receiver(&self) -> Option<&HeartbeatReceiver> {
        match self {
            Heartbeat::Receiver(receiver) => Some(receiver),
            Heartbeat::Sender(_) => None,
        }
    }
}
