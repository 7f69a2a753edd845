use crate::domain::error::{SerialdError, SerialdResult};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

pub const UNIX_PREFIX: &str = "unix:";

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// An accepted or dialed connection, already split into halves.
pub struct Connection {
    /// Remote address, or a generated id for local sockets
    pub peer: String,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Connection {
    pub fn new(peer: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            peer: peer.into(),
            reader,
            writer,
        }
    }

    pub fn from_stream<S>(peer: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(peer, Box::new(reader), Box::new(writer))
    }

    fn from_tcp(stream: TcpStream, peer: String) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(peer, Box::new(reader), Box::new(writer))
    }
}

/// `:5000` style addresses listen on every interface.
fn tcp_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    /// Bind `host:port` or `unix:PATH`. A stale socket file at PATH is
    /// removed first.
    pub async fn bind(addr: &str) -> SerialdResult<Self> {
        if let Some(path) = addr.strip_prefix(UNIX_PREFIX) {
            return Self::bind_unix(Path::new(path));
        }
        let listener = TcpListener::bind(tcp_addr(addr)).await.map_err(|e| {
            SerialdError::Io(io::Error::new(e.kind(), format!("Error listening: {}", e)))
        })?;
        Ok(Listener::Tcp(listener))
    }

    #[cfg(unix)]
    fn bind_unix(path: &Path) -> SerialdResult<Self> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                SerialdError::Io(io::Error::new(e.kind(), format!("Unlink old sock file: {}", e)))
            })?;
            debug!(path = %path.display(), "removed stale socket");
        }
        let listener = tokio::net::UnixListener::bind(path).map_err(|e| {
            SerialdError::Io(io::Error::new(e.kind(), format!("Error listening: {}", e)))
        })?;
        Ok(Listener::Unix {
            listener,
            path: path.to_path_buf(),
        })
    }

    #[cfg(not(unix))]
    fn bind_unix(path: &Path) -> SerialdResult<Self> {
        Err(SerialdError::Config {
            message: format!("local sockets are not supported here: {}", path.display()),
        })
    }

    /// Bound address in the same notation accepted by [`bind`](Self::bind).
    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            #[cfg(unix)]
            Listener::Unix { path, .. } => format!("{}{}", UNIX_PREFIX, path.display()),
        }
    }

    /// Socket file owned by this listener, if any.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Listener::Tcp(_) => None,
            #[cfg(unix)]
            Listener::Unix { path, .. } => Some(path.as_path()),
        }
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok(Connection::from_tcp(stream, addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                let peer = format!("unix:{}", uuid::Uuid::new_v4().simple());
                let (reader, writer) = stream.into_split();
                Ok(Connection::new(peer, Box::new(reader), Box::new(writer)))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = self.socket_path() {
            remove_socket_file(path);
        }
    }
}

/// Remove a socket file, tolerating it being gone already.
pub fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "socket removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "socket removal failed"),
    }
}

/// Dial `host:port` or `unix:PATH`.
pub async fn connect(addr: &str) -> SerialdResult<Connection> {
    let dial_err = |e: io::Error| {
        SerialdError::Io(io::Error::new(e.kind(), format!("Dial failed: {}", e)))
    };

    if let Some(path) = addr.strip_prefix(UNIX_PREFIX) {
        #[cfg(unix)]
        {
            let stream = tokio::net::UnixStream::connect(path).await.map_err(dial_err)?;
            let (reader, writer) = stream.into_split();
            return Ok(Connection::new(addr, Box::new(reader), Box::new(writer)));
        }
        #[cfg(not(unix))]
        {
            return Err(SerialdError::Config {
                message: format!("local sockets are not supported here: {}", path),
            });
        }
    }

    let stream = TcpStream::connect(tcp_addr(addr)).await.map_err(dial_err)?;
    Ok(Connection::from_tcp(stream, addr.to_string()))
}
