//! Duplex byte streams over TCP loopback or Unix-domain sockets.
//!
//! - [`Endpoint`] names where to dial or bind
//! - [`Transport`] is one connected stream, split into owned halves
//! - [`TransportListener`] binds an endpoint and accepts transports; a TCP
//!   listener bound to port 0 reports the OS-assigned port

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::{IpcError, Result};
use crate::ipc::frame::read_full;

/// Address of a listening peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    /// `127.0.0.1:<port>`; port 0 asks the OS for an ephemeral port on bind.
    pub fn tcp_loopback(port: u16) -> Self {
        Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Tcp { port, .. } => Some(*port),
            Endpoint::Unix(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Read half of a transport.
pub struct TransportReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl TransportReader {
    /// Block until exactly `count` bytes arrive.
    ///
    /// A peer close before the first byte is `Closed`; a close part-way
    /// through is `ShortRead`.
    pub async fn receive(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        match read_full(&mut self.inner, &mut buf).await {
            Ok(()) => Ok(buf),
            Err(IpcError::ShortRead { received: 0, .. }) if count > 0 => Err(IpcError::Closed),
            Err(e) => Err(e),
        }
    }
}

impl AsyncRead for TransportReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Write half of a transport.
pub struct TransportWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
}

impl TransportWriter {
    /// Write the whole buffer or fail.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .await
            .map_err(|e| IpcError::SendFailed(e.to_string()))?;
        self.inner.flush().await.map_err(|e| IpcError::SendFailed(e.to_string()))
    }

    /// Shut down the write direction; the peer sees EOF.
    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

impl AsyncWrite for TransportWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// One connected duplex stream.
pub struct Transport {
    reader: TransportReader,
    writer: TransportWriter,
    endpoint: Endpoint,
}

impl Transport {
    /// Dial an endpoint.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| IpcError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
                stream.set_nodelay(true)?;
                Ok(Self::from_tcp(stream, endpoint.clone()))
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| IpcError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
                Ok(Self::from_unix(stream, endpoint.clone()))
            }
        }
    }

    pub fn from_tcp(stream: TcpStream, endpoint: Endpoint) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: TransportReader { inner: Box::new(r) },
            writer: TransportWriter { inner: Box::new(w) },
            endpoint,
        }
    }

    pub fn from_unix(stream: UnixStream, endpoint: Endpoint) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: TransportReader { inner: Box::new(r) },
            writer: TransportWriter { inner: Box::new(w) },
            endpoint,
        }
    }

    /// Peer endpoint for dialed transports, local endpoint for accepted ones.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.send(bytes).await
    }

    pub async fn receive(&mut self, count: usize) -> Result<Vec<u8>> {
        self.reader.receive(count).await
    }

    pub fn reader_mut(&mut self) -> &mut TransportReader {
        &mut self.reader
    }

    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}

/// Bound listening socket.
pub enum TransportListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl TransportListener {
    /// Bind an endpoint.
    ///
    /// Unix paths get their parent directory created and any stale socket
    /// file removed first.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(TransportListener::Tcp(listener))
            }
            Endpoint::Unix(path) => {
                prepare_socket_path(path)?;
                let listener = UnixListener::bind(path)?;
                Ok(TransportListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// The port actually bound (TCP only).
    pub fn local_port(&self) -> Option<u16> {
        match self {
            TransportListener::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            TransportListener::Unix { .. } => None,
        }
    }

    /// Endpoint a client should dial to reach this listener.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            TransportListener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            TransportListener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    pub async fn accept(&self) -> Result<Transport> {
        match self {
            TransportListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let endpoint = self.local_endpoint()?;
                Ok(Transport::from_tcp(stream, endpoint))
            }
            TransportListener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(Transport::from_unix(stream, Endpoint::Unix(path.clone())))
            }
        }
    }
}

impl Drop for TransportListener {
    fn drop(&mut self) {
        if let TransportListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
