use super::TransportError;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Ipc(PathBuf),
    Inproc(String),
}

impl Endpoint {
    /// Parse `tcp://host:port`, `ipc:///path` or `inproc://name`.
    ///
    /// A `*` host is accepted and binds every interface. Port 0 is only
    /// meaningful for binding and asks the OS for a free port.
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;

        match scheme {
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                let port: u16 = port.parse().map_err(|_| invalid())?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "ipc" if !rest.is_empty() => Ok(Endpoint::Ipc(PathBuf::from(rest))),
            "inproc" if !rest.is_empty() => Ok(Endpoint::Inproc(rest.to_string())),
            _ => Err(invalid()),
        }
    }

    /// `host:port` to hand to the OS when binding.
    pub(crate) fn bind_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } if host == "*" => Some(format!("0.0.0.0:{}", port)),
            Endpoint::Tcp { host, port } => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }

    /// `host:port` to dial.
    pub(crate) fn dial_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } if host == "*" => Some(format!("127.0.0.1:{}", port)),
            Endpoint::Tcp { host, port } => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Endpoint::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}
