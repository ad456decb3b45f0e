//! Unix-domain control socket for shutdown commands.
//!
//! Each managed process listens on its own control socket. A client sends a
//! typed `ShutdownRequest` frame and gets a `ShutdownResponse` back; a lone
//! byte `99` from older clients is accepted as the same request. The two are
//! told apart by the first byte: a real frame's length prefix starts with a
//! byte no larger than 1 because frames are capped at 16 MB.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::ipc::connection::{Connection, ConnectionConfig};
use crate::ipc::frame::{DEFAULT_MAX_FRAME_LENGTH, read_frame};
use crate::ipc::messages::{Message, MessageType, ShutdownRequest, ShutdownResponse, describe_tag};
use crate::ipc::transport::{Endpoint, Transport, TransportListener};

/// Single-byte shutdown command understood for compatibility.
pub const LEGACY_SHUTDOWN_BYTE: u8 = 99;

/// Listener that turns shutdown commands into a cancellation.
pub struct ControlServer {
    listener: TransportListener,
    path: PathBuf,
    shutdown: CancellationToken,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one.
    pub async fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let listener = TransportListener::bind(&Endpoint::Unix(path.clone())).await?;
        debug!("Control socket bound at {}", path.display());
        Ok(Self {
            listener,
            path,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cancelled once a shutdown command has been received.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve control clients until a shutdown command arrives or the token
    /// is cancelled from elsewhere. The socket file is removed on return.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(transport) => {
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_control_client(transport, shutdown).await {
                                warn!("Control client failed: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Control accept error: {}", e),
                }
            }
        }
        Ok(())
    }
}

async fn handle_control_client(mut transport: Transport, shutdown: CancellationToken) -> Result<()> {
    let first = transport.receive(1).await?;
    if first[0] == LEGACY_SHUTDOWN_BYTE {
        info!("Legacy shutdown byte received");
        shutdown.cancel();
        return Ok(());
    }

    let frame = {
        let mut stream = (&first[..]).chain(transport.reader_mut());
        read_frame(&mut stream, DEFAULT_MAX_FRAME_LENGTH).await?
    };

    if frame.tag != MessageType::ShutdownRequest.tag() {
        return Err(IpcError::UnexpectedMessage {
            expected: MessageType::ShutdownRequest.to_string(),
            actual: describe_tag(frame.tag),
        });
    }

    info!("Shutdown requested over control socket");
    let reply = ShutdownResponse::ok("shutting down").to_frame()?.encode()?;
    let sent = transport.send(&reply).await;
    shutdown.cancel();
    sent
}

/// Send a typed `ShutdownRequest` to a control socket.
pub async fn request_shutdown(path: &Path, timeout: Duration) -> Result<ShutdownResponse> {
    let config = ConnectionConfig {
        connect_timeout: timeout,
        request_timeout: timeout,
        ..Default::default()
    };
    let connection = Connection::new(config);
    connection.connect(&Endpoint::Unix(path.to_path_buf())).await?;
    let response = connection.request(&ShutdownRequest {}).await;
    connection.disconnect().await;
    response
}
