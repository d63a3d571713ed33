//! Connection descriptors: immutable descriptions of a transport endpoint.
//!
//! A descriptor is validated once at construction and then renders a canonical
//! connection string for either side of a link. Binding and connecting only
//! differ in the host portion of TCP endpoints; the scheme never changes.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("Port must be specified for the tcp transport")]
    MissingPort,
    #[error("Host must be specified for the tcp transport")]
    MissingHost,
    #[error("Ipc path must be specified for the ipc transport, e.g. '/tmp/liveness.ipc'")]
    MissingPath,
    #[error("A unique identifier must be specified for the inproc transport, e.g. 'thread1'")]
    MissingIdentifier,
    #[error("Unsupported transport scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("Malformed connection string '{0}'")]
    Malformed(String),
}

/// Transport family of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Networked transport (host:port)
    Tcp,
    /// Local-socket transport (filesystem path)
    Ipc,
    /// Intra-process transport (identifier within one `Context`)
    Inproc,
}

impl TransportKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ipc => "ipc",
            TransportKind::Inproc => "inproc",
        }
    }
}

/// Which side of a link a participant takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Bind,
    Connect,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Target {
    Tcp { host: String, port: u16 },
    Ipc { path: PathBuf },
    Inproc { identifier: String },
}

/// Immutable description of a transport endpoint.
///
/// # Examples
/// ```
/// use liveness_core::{ConnectionDescriptor, LinkMode};
///
/// let descriptor = ConnectionDescriptor::tcp("localhost", 5556).unwrap();
/// assert_eq!(descriptor.connection_string(LinkMode::Bind), "tcp://*:5556");
/// assert_eq!(descriptor.connection_string(LinkMode::Connect), "tcp://localhost:5556");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "DescriptorRepr", into = "String")]
pub struct ConnectionDescriptor {
    target: Target,
}

impl ConnectionDescriptor {
    /// Describe a TCP endpoint. The host is only used when connecting.
    pub fn tcp(host: impl Into<String>, port: u16) -> Result<Self, DescriptorError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(DescriptorError::MissingHost);
        }
        if port == 0 {
            return Err(DescriptorError::MissingPort);
        }
        Ok(Self {
            target: Target::Tcp { host, port },
        })
    }

    /// Describe a local-socket endpoint.
    pub fn ipc(path: impl Into<PathBuf>) -> Result<Self, DescriptorError> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(DescriptorError::MissingPath);
        }
        Ok(Self {
            target: Target::Ipc { path },
        })
    }

    /// Describe an intra-process endpoint.
    pub fn inproc(identifier: impl Into<String>) -> Result<Self, DescriptorError> {
        let identifier = identifier.into();
        if identifier.trim().is_empty() {
            return Err(DescriptorError::MissingIdentifier);
        }
        Ok(Self {
            target: Target::Inproc { identifier },
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self.target {
            Target::Tcp { .. } => TransportKind::Tcp,
            Target::Ipc { .. } => TransportKind::Ipc,
            Target::Inproc { .. } => TransportKind::Inproc,
        }
    }

    /// Path of an ipc descriptor.
    pub fn ipc_path(&self) -> Option<&Path> {
        match &self.target {
            Target::Ipc { path } => Some(path),
            _ => None,
        }
    }

    /// Render the canonical connection string for one side of the link.
    pub fn connection_string(&self, mode: LinkMode) -> String {
        match (&self.target, mode) {
            (Target::Tcp { port, .. }, LinkMode::Bind) => format!("tcp://*:{}", port),
            (Target::Tcp { host, port }, LinkMode::Connect) => {
                // A wildcard host only makes sense for binding.
                let host = if host == "*" { "localhost" } else { host };
                format!("tcp://{}:{}", host, port)
            }
            (Target::Ipc { path }, _) => format!("ipc://{}", path.display()),
            (Target::Inproc { identifier }, _) => format!("inproc://{}", identifier),
        }
    }
}

impl Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.connection_string(LinkMode::Connect))
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| DescriptorError::Malformed(s.to_string()))?;

        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| DescriptorError::Malformed(s.to_string()))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| DescriptorError::Malformed(s.to_string()))?;
                Self::tcp(host, port)
            }
            "ipc" => Self::ipc(rest),
            "inproc" => Self::inproc(rest),
            other => Err(DescriptorError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl From<ConnectionDescriptor> for String {
    fn from(descriptor: ConnectionDescriptor) -> String {
        descriptor.to_string()
    }
}

/// Accepted JSON forms: a connection string, or a tagged object.
#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorRepr {
    Uri(String),
    Object(DescriptorObject),
}

#[derive(Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
enum DescriptorObject {
    Tcp {
        #[serde(default = "default_host")]
        host: String,
        port: u16,
    },
    Ipc {
        path: PathBuf,
    },
    Inproc {
        identifier: String,
    },
}

fn default_host() -> String {
    "localhost".to_string()
}

impl TryFrom<DescriptorRepr> for ConnectionDescriptor {
    type Error = DescriptorError;

    fn try_from(repr: DescriptorRepr) -> Result<Self, Self::Error> {
        match repr {
            DescriptorRepr::Uri(uri) => uri.parse(),
            DescriptorRepr::Object(DescriptorObject::Tcp { host, port }) => Self::tcp(host, port),
            DescriptorRepr::Object(DescriptorObject::Ipc { path }) => Self::ipc(path),
            DescriptorRepr::Object(DescriptorObject::Inproc { identifier }) => Self::inproc(identifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Construction ====================

    #[test]
    fn test_tcp_requires_port_and_host() {
        assert_eq!(
            ConnectionDescriptor::tcp("localhost", 0),
            Err(DescriptorError::MissingPort)
        );
        assert_eq!(
            ConnectionDescriptor::tcp("", 5556),
            Err(DescriptorError::MissingHost)
        );
    }

    #[test]
    fn test_ipc_requires_path() {
        assert_eq!(
            ConnectionDescriptor::ipc(""),
            Err(DescriptorError::MissingPath)
        );
    }

    #[test]
    fn test_inproc_requires_identifier() {
        assert_eq!(
            ConnectionDescriptor::inproc("  "),
            Err(DescriptorError::MissingIdentifier)
        );
    }

    // ==================== Connection strings ====================

    #[test]
    fn test_tcp_bind_uses_wildcard() {
        let d = ConnectionDescriptor::tcp("10.0.0.5", 5555).unwrap();
        assert_eq!(d.connection_string(LinkMode::Bind), "tcp://*:5555");
        assert_eq!(d.connection_string(LinkMode::Connect), "tcp://10.0.0.5:5555");
        assert_eq!(d.kind(), TransportKind::Tcp);
    }

    #[test]
    fn test_ipc_and_inproc_ignore_mode() {
        let ipc = ConnectionDescriptor::ipc("/tmp/app.ipc").unwrap();
        assert_eq!(ipc.connection_string(LinkMode::Bind), "ipc:///tmp/app.ipc");
        assert_eq!(ipc.connection_string(LinkMode::Connect), "ipc:///tmp/app.ipc");

        let inproc = ConnectionDescriptor::inproc("workers").unwrap();
        assert_eq!(inproc.connection_string(LinkMode::Bind), "inproc://workers");
        assert_eq!(inproc.connection_string(LinkMode::Connect), "inproc://workers");
    }

    #[test]
    fn test_wildcard_host_connects_to_localhost() {
        let d: ConnectionDescriptor = "tcp://*:7000".parse().unwrap();
        assert_eq!(d.connection_string(LinkMode::Connect), "tcp://localhost:7000");
        assert_eq!(d.connection_string(LinkMode::Bind), "tcp://*:7000");
    }

    // ==================== Parsing ====================

    #[test]
    fn test_parse_each_scheme() {
        let tcp: ConnectionDescriptor = "tcp://localhost:5556".parse().unwrap();
        assert_eq!(tcp.kind(), TransportKind::Tcp);

        let ipc: ConnectionDescriptor = "ipc:///tmp/hb.ipc".parse().unwrap();
        assert_eq!(ipc.ipc_path(), Some(Path::new("/tmp/hb.ipc")));

        let inproc: ConnectionDescriptor = "inproc://hb".parse().unwrap();
        assert_eq!(inproc.kind(), TransportKind::Inproc);
    }

    #[test]
    fn test_parse_rejects_bad_strings() {
        assert!(matches!(
            "localhost:5556".parse::<ConnectionDescriptor>(),
            Err(DescriptorError::Malformed(_))
        ));
        assert!(matches!(
            "udp://localhost:5556".parse::<ConnectionDescriptor>(),
            Err(DescriptorError::UnsupportedScheme(s)) if s == "udp"
        ));
        assert!(matches!(
            "tcp://localhost:notaport".parse::<ConnectionDescriptor>(),
            Err(DescriptorError::Malformed(_))
        ));
        assert_eq!(
            "inproc://".parse::<ConnectionDescriptor>(),
            Err(DescriptorError::MissingIdentifier)
        );
    }

    // ==================== Serde ====================

    #[test]
    fn test_deserialize_string_and_object_forms() {
        let from_str: ConnectionDescriptor =
            serde_json::from_str(r#""tcp://localhost:5556""#).unwrap();
        let from_obj: ConnectionDescriptor =
            serde_json::from_str(r#"{"transport":"tcp","port":5556}"#).unwrap();
        assert_eq!(from_str, from_obj);

        let ipc: ConnectionDescriptor =
            serde_json::from_str(r#"{"transport":"ipc","path":"/tmp/x.ipc"}"#).unwrap();
        assert_eq!(ipc.kind(), TransportKind::Ipc);
    }

    #[test]
    fn test_deserialize_validates() {
        let result: Result<ConnectionDescriptor, _> =
            serde_json::from_str(r#"{"transport":"inproc","identifier":""}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serializes_as_connect_string() {
        let d = ConnectionDescriptor::inproc("hb").unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), r#""inproc://hb""#);
    }
}
