//! Node identity: a durable node id plus a per-process session id.
//!
//! The node id is persisted per role in a JSON file so a restarted process
//! keeps its name, while the session id is regenerated on every start. A
//! receiver keys its records on both, so an old and a new incarnation of the
//! same node are never conflated.

use crate::descriptor::LinkMode;
use crate::heartbeat::HeartbeatRole;
use crate::transport::SocketKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity field '{0}' must not be empty")]
    Empty(&'static str),

    #[error("Failed to access identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse identity file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown node role '{0}' (expected router, worker, client or server)")]
    UnknownRole(String),
}

/// Generate a durable node id: 32 lowercase hex chars.
pub fn generate_node_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a session id: 16 lowercase hex chars.
pub fn generate_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// `{node_id, session_id}` pair identifying one running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub session_id: String,
}

impl NodeIdentity {
    pub fn new(
        node_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let node_id = node_id.into();
        let session_id = session_id.into();
        if node_id.is_empty() {
            return Err(IdentityError::Empty("node_id"));
        }
        if session_id.is_empty() {
            return Err(IdentityError::Empty("session_id"));
        }
        Ok(Self {
            node_id,
            session_id,
        })
    }

    /// Identity for a new process reusing a persisted node id.
    pub fn fresh(node_id: impl Into<String>) -> Result<Self, IdentityError> {
        Self::new(node_id, generate_session_id())
    }

    /// Identity with a newly generated node id.
    pub fn generate() -> Self {
        Self {
            node_id: generate_node_id(),
            session_id: generate_session_id(),
        }
    }

    /// Flat `node_id_session_id` form, used as the socket routing id and in
    /// logs. Not unique when either id contains `_`; the registry keys on the
    /// pair itself.
    pub fn registry_key(&self) -> String {
        format!("{}_{}", self.node_id, self.session_id)
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.session_id)
    }
}

/// Role a node plays. Decides its main socket and its heartbeat side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Router,
    Worker,
    Client,
    Server,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Router => "router",
            NodeRole::Worker => "worker",
            NodeRole::Client => "client",
            NodeRole::Server => "server",
        }
    }

    pub fn socket_kind(&self) -> SocketKind {
        match self {
            NodeRole::Router => SocketKind::Router,
            NodeRole::Worker => SocketKind::Dealer,
            NodeRole::Client => SocketKind::Request,
            NodeRole::Server => SocketKind::Reply,
        }
    }

    pub fn link_mode(&self) -> LinkMode {
        match self {
            NodeRole::Router | NodeRole::Server => LinkMode::Bind,
            NodeRole::Worker | NodeRole::Client => LinkMode::Connect,
        }
    }

    /// Connecting roles announce liveness, binding roles observe it.
    pub fn heartbeat_role(&self) -> HeartbeatRole {
        match self.link_mode() {
            LinkMode::Connect => HeartbeatRole::Sender,
            LinkMode::Bind => HeartbeatRole::Receiver,
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "router" => Ok(NodeRole::Router),
            "worker" => Ok(NodeRole::Worker),
            "client" => Ok(NodeRole::Client),
            "server" => Ok(NodeRole::Server),
            _ => Err(IdentityError::UnknownRole(s.to_string())),
        }
    }
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

const NODE_ID_KEY: &str = "node_id";

/// JSON file of per-role sections holding persisted node ids.
///
/// ```json
/// { "worker": { "node_id": "3f2a..." }, "router": { "node_id": "9bc0..." } }
/// ```
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the persisted node id for `role`, generating and saving one on
    /// first run. Other sections and keys in the file are preserved.
    pub fn load_or_generate(&self, role: NodeRole) -> Result<String, IdentityError> {
        let mut sections = self.load()?;
        let section = sections.entry(role.to_string()).or_default();

        if let Some(node_id) = section.get(NODE_ID_KEY).filter(|id| !id.is_empty()) {
            return Ok(node_id.clone());
        }

        let node_id = generate_node_id();
        tracing::warn!(
            "No node_id for role '{}' in {}; generated {}",
            role,
            self.path.display(),
            node_id
        );
        section.insert(NODE_ID_KEY.to_string(), node_id.clone());
        self.save(&sections)?;
        Ok(node_id)
    }

    /// Load the node id and pair it with a fresh session id.
    pub fn identity_for(&self, role: NodeRole) -> Result<NodeIdentity, IdentityError> {
        NodeIdentity::fresh(self.load_or_generate(role)?)
    }

    fn load(&self) -> Result<Sections, IdentityError> {
        if !self.path.exists() {
            return Ok(Sections::new());
        }
        let contents = fs::read_to_string(&self.path).map_err(|source| IdentityError::Io {
            path: self.path.clone(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(Sections::new());
        }
        serde_json::from_str(&contents).map_err(|source| IdentityError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, sections: &Sections) -> Result<(), IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let contents = serde_json::to_string_pretty(sections).map_err(|source| {
            IdentityError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, contents).map_err(io_err)
    }
}
