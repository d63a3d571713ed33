//! Byte streams behind the three endpoint families.

use super::{Context, Endpoint};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Buffer size of each direction of an in-process pipe.
const INPROC_BUFFER: usize = 64 * 1024;

/// Bidirectional stream usable behind dynamic dispatch.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub(crate) type BoxStream = Box<dyn AsyncStream>;

fn refused(endpoint: &Endpoint) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("nothing bound at {}", endpoint),
    )
}

/// Open a stream to a bound endpoint.
pub(crate) async fn dial(ctx: &Context, endpoint: &Endpoint) -> io::Result<BoxStream> {
    match endpoint {
        Endpoint::Tcp { .. } => {
            let addr = endpoint.dial_addr().ok_or_else(|| refused(endpoint))?;
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Ipc(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Ipc(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ipc endpoints require a unix platform",
        )),
        Endpoint::Inproc(name) => {
            let acceptor = ctx
                .inproc_registry()
                .get(name)
                .cloned()
                .ok_or_else(|| refused(endpoint))?;
            let (local, remote) = tokio::io::duplex(INPROC_BUFFER);
            acceptor.send(remote).map_err(|_| refused(endpoint))?;
            Ok(Box::new(local))
        }
    }
}

/// Accepting side of an endpoint.
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Ipc {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
    },
    Inproc {
        name: String,
        ctx: Context,
        acceptor: mpsc::UnboundedSender<DuplexStream>,
        pending: mpsc::UnboundedReceiver<DuplexStream>,
    },
}

impl Listener {
    pub(crate) async fn bind(ctx: &Context, endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { .. } => {
                let addr = endpoint.bind_addr().ok_or_else(|| refused(endpoint))?;
                Ok(Listener::Tcp(TcpListener::bind(addr).await?))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                // A socket file left behind by a dead process blocks the bind.
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!("Removed stale ipc socket {}", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Listener::Ipc {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ipc endpoints require a unix platform",
            )),
            Endpoint::Inproc(name) => {
                let mut registry = ctx.inproc_registry();
                if registry.get(name).is_some_and(|tx| !tx.is_closed()) {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("inproc://{} is already bound", name),
                    ));
                }
                let (acceptor, pending) = mpsc::unbounded_channel();
                registry.insert(name.clone(), acceptor.clone());
                Ok(Listener::Inproc {
                    name: name.clone(),
                    ctx: ctx.clone(),
                    acceptor,
                    pending,
                })
            }
        }
    }

    pub(crate) async fn accept(&mut self) -> io::Result<BoxStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Ipc { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Inproc { pending, .. } => match pending.recv().await {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            },
        }
    }

    /// Endpoint as actually bound; resolves an OS-assigned TCP port.
    pub(crate) fn local_endpoint(&self) -> io::Result<String> {
        match self {
            Listener::Tcp(listener) => Ok(format!("tcp://{}", listener.local_addr()?)),
            #[cfg(unix)]
            Listener::Ipc { path, .. } => Ok(format!("ipc://{}", path.display())),
            Listener::Inproc { name, .. } => Ok(format!("inproc://{}", name)),
        }
    }

    /// Registration to withdraw when the owning socket closes.
    pub(crate) fn inproc_registration(&self) -> Option<(String, mpsc::UnboundedSender<DuplexStream>)> {
        match self {
            Listener::Inproc { name, acceptor, .. } => Some((name.clone(), acceptor.clone())),
            _ => None,
        }
    }
}

/// Remove an inproc name from the registry if it still points at `acceptor`.
pub(crate) fn unregister_inproc(
    ctx: &Context,
    name: &str,
    acceptor: &mpsc::UnboundedSender<DuplexStream>,
) {
    let mut registry = ctx.inproc_registry();
    if registry.get(name).is_some_and(|tx| tx.same_channel(acceptor)) {
        registry.remove(name);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Inproc {
            name,
            ctx,
            acceptor,
            ..
        } = self
        {
            unregister_inproc(ctx, name, acceptor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_inproc_dial_requires_bind() {
        let ctx = Context::new();
        let ep = Endpoint::Inproc("nobody".into());
        let err = dial(&ctx, &ep).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_inproc_pipe_carries_bytes() {
        let ctx = Context::new();
        let ep = Endpoint::Inproc("pipe".into());
        let mut listener = Listener::bind(&ctx, &ep).await.unwrap();

        let mut client = dial(&ctx, &ep).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_inproc_double_bind_and_release() {
        let ctx = Context::new();
        let ep = Endpoint::Inproc("once".into());
        let listener = Listener::bind(&ctx, &ep).await.unwrap();
        let err = Listener::bind(&ctx, &ep).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        drop(listener);
        assert!(Listener::bind(&ctx, &ep).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_port_zero_resolves() {
        let ctx = Context::new();
        let ep = Endpoint::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&ctx, &ep).await.unwrap();
        let local = listener.local_endpoint().unwrap();
        assert!(local.starts_with("tcp://127.0.0.1:"));
        assert!(!local.ends_with(":0"));
    }
}
