//! Message server: accept, CONNECT handshake, per-role dispatch
//!
//! Provides:
//! - One lightweight task per accepted socket, reading frames as they arrive
//! - Role handshake on the first frame of every connection
//! - A handler per client, created by a [`HandlerFactory`] for the declared
//!   role and dropped when the socket closes
//! - A [`ClientHandle`] per client for pushing frames nobody asked for
//! - A client registry guarded by a single lock, cleared by `stop()`

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::ipc::frame::{DEFAULT_MAX_FRAME_LENGTH, Frame, FrameCodec};
use crate::ipc::messages::{ConnectRequest, ConnectResponse, Message, MessageType, Role, describe_tag};
use crate::ipc::transport::{Transport, TransportListener, TransportReader, TransportWriter};

/// Identifier the server assigns to each accepted socket
pub type ClientId = u64;

/// Pushed frames buffered per client
const OUTBOUND_CAPACITY: usize = 64;

/// Configuration for the message server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest accepted frame length
    pub max_frame_length: usize,
    /// Maximum number of concurrent clients
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_clients: 64,
        }
    }
}

impl ServerConfig {
    /// Set max frame length
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    /// Set max clients
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }
}

/// What a handler wants done with a frame it was given
#[derive(Debug)]
pub enum Dispatch {
    /// Write these frames back, in order
    Reply(Vec<Frame>),
    /// Nothing to send
    NoReply,
    /// Tag not handled by this role; logged and dropped
    Unhandled,
    /// Write these frames back, then signal the server's shutdown token
    Shutdown(Vec<Frame>),
}

impl Dispatch {
    /// Reply with a single typed message
    pub fn reply<M: Message>(message: &M) -> Self {
        match message.to_frame() {
            Ok(frame) => Dispatch::Reply(vec![frame]),
            Err(e) => {
                warn!("Failed to encode {}: {}", M::TYPE, e);
                Dispatch::NoReply
            }
        }
    }
}

/// Per-client, role-specific frame handler
#[async_trait]
pub trait RoleHandler: Send {
    /// Handle one frame received after the handshake
    async fn handle(&mut self, frame: Frame) -> Dispatch;

    /// Called once when the client's socket closes
    async fn closed(&mut self) {}
}

/// Lets a handler push frames to its client outside of replies
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    pub role: Role,
    outbound: mpsc::Sender<Frame>,
}

impl ClientHandle {
    /// Queue an unsolicited frame; false if the client is gone or backed up
    pub fn push(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("Client {} not accepting pushes: {}", self.id, e);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Creates the handler for a newly identified client
pub trait HandlerFactory: Send + Sync + 'static {
    /// `None` rejects the role and closes the socket
    fn create(&self, client: &ClientHandle) -> Option<Box<dyn RoleHandler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&ClientHandle) -> Option<Box<dyn RoleHandler>> + Send + Sync + 'static,
{
    fn create(&self, client: &ClientHandle) -> Option<Box<dyn RoleHandler>> {
        self(client)
    }
}

/// Registered client
#[derive(Debug)]
struct ClientEntry {
    role: Option<Role>,
    cancel: CancellationToken,
}

struct ServerInner {
    config: ServerConfig,
    factory: Box<dyn HandlerFactory>,
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    next_client_id: AtomicU64,
    stop: CancellationToken,
    shutdown_requested: CancellationToken,
}

/// Concurrent message server
#[derive(Clone)]
pub struct MessageServer {
    inner: Arc<ServerInner>,
}

impl MessageServer {
    /// Create a server that builds handlers with `factory`
    pub fn new(config: ServerConfig, factory: impl HandlerFactory) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                factory: Box::new(factory),
                clients: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
                stop: CancellationToken::new(),
                shutdown_requested: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Get count of connected clients
    pub async fn client_count(&self) -> usize {
        self.inner.clients.lock().await.len()
    }

    /// Roles of clients that completed the handshake
    pub async fn client_roles(&self) -> Vec<(ClientId, Role)> {
        let clients = self.inner.clients.lock().await;
        let mut roles: Vec<_> = clients
            .iter()
            .filter_map(|(id, entry)| entry.role.map(|role| (*id, role)))
            .collect();
        roles.sort_by_key(|(id, _)| *id);
        roles
    }

    /// Cancelled when a handler asks the process to shut down
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.inner.shutdown_requested.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Accept clients until `stop()` is called
    pub async fn run(&self, listener: TransportListener) -> Result<()> {
        info!("Message server listening on {}", listener.local_endpoint()?);
        loop {
            tokio::select! {
                _ = self.inner.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(transport) => {
                        self.accept_client(transport).await;
                    }
                    Err(e) => warn!("Accept error: {}", e),
                }
            }
        }
        debug!("Message server accept loop finished");
        Ok(())
    }

    /// Register an accepted socket and start reading from it
    ///
    /// Returns `None` when the server is stopped or at capacity, in which
    /// case the socket is closed.
    pub async fn accept_client(&self, transport: Transport) -> Option<ClientId> {
        let (id, cancel) = {
            let mut clients = self.inner.clients.lock().await;
            if self.inner.stop.is_cancelled() {
                return None;
            }
            if clients.len() >= self.inner.config.max_clients {
                warn!("Rejecting client, at capacity ({})", self.inner.config.max_clients);
                return None;
            }
            let cancel = self.inner.stop.child_token();
            let id = self.inner.next_client_id.fetch_add(1, Ordering::SeqCst);
            clients.insert(
                id,
                ClientEntry {
                    role: None,
                    cancel: cancel.clone(),
                },
            );
            (id, cancel)
        };

        debug!("Accepted client {}", id);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            serve_client(inner, id, transport, cancel).await;
        });
        Some(id)
    }

    /// Stop accepting, close every client socket and drop their handlers
    pub async fn stop(&self) {
        let mut clients = self.inner.clients.lock().await;
        self.inner.stop.cancel();
        for (_, entry) in clients.drain() {
            entry.cancel.cancel();
        }
        info!("Message server stopped");
    }
}

async fn serve_client(inner: Arc<ServerInner>, id: ClientId, transport: Transport, cancel: CancellationToken) {
    let (reader, writer) = transport.into_split();
    let max = inner.config.max_frame_length;
    let mut frames = FramedRead::new(reader, FrameCodec::with_max_length(max));
    let mut sink = FramedWrite::new(writer, FrameCodec::with_max_length(max));

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = client_session(&inner, id, &mut frames, &mut sink) => result,
    };

    match result {
        Ok(()) => debug!("Client {} disconnected", id),
        Err(e) => warn!("Closing client {}: {}", id, e),
    }

    let _ = sink.close().await;
    inner.clients.lock().await.remove(&id);
}

async fn client_session(
    inner: &ServerInner,
    id: ClientId,
    frames: &mut FramedRead<TransportReader, FrameCodec>,
    sink: &mut FramedWrite<TransportWriter, FrameCodec>,
) -> Result<()> {
    let first = match frames.next().await {
        Some(frame) => frame?,
        None => return Ok(()),
    };
    let role = ConnectRequest::from_frame(&first)
        .map_err(|e| IpcError::Handshake(e.to_string()))?
        .role;

    let (outbound, mut pushed) = mpsc::channel(OUTBOUND_CAPACITY);
    let client = ClientHandle { id, role, outbound };
    let Some(mut handler) = inner.factory.create(&client) else {
        let refusal = ConnectResponse {
            error: format!("role {} is not served here", role),
        };
        sink.send(refusal.to_frame()?).await?;
        return Err(IpcError::Handshake(format!("role {} rejected", role)));
    };

    if let Some(entry) = inner.clients.lock().await.get_mut(&id) {
        entry.role = Some(role);
    }
    sink.send(ConnectResponse::ok().to_frame()?).await?;
    info!("Client {} connected as {}", id, role);

    drop(client);

    let outcome = dispatch_frames(inner, id, handler.as_mut(), &mut pushed, frames, sink).await;
    handler.closed().await;
    outcome
}

async fn dispatch_frames(
    inner: &ServerInner,
    id: ClientId,
    handler: &mut dyn RoleHandler,
    pushed: &mut mpsc::Receiver<Frame>,
    frames: &mut FramedRead<TransportReader, FrameCodec>,
    sink: &mut FramedWrite<TransportWriter, FrameCodec>,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            Some(frame) = pushed.recv() => {
                sink.send(frame).await?;
                continue;
            }
            frame = frames.next() => match frame {
                Some(frame) => frame?,
                None => return Ok(()),
            },
        };
        if MessageType::try_from(frame.tag).is_err() {
            warn!("Client {} sent unknown tag {}, dropping", id, frame.tag);
            continue;
        }

        let tag = frame.tag;
        match handler.handle(frame).await {
            Dispatch::Reply(replies) => {
                for reply in replies {
                    sink.send(reply).await?;
                }
            }
            Dispatch::NoReply => {}
            Dispatch::Unhandled => {
                warn!("Client {} sent {} which its role does not handle, dropping", id, describe_tag(tag));
            }
            Dispatch::Shutdown(replies) => {
                for reply in replies {
                    sink.send(reply).await?;
                }
                info!("Client {} requested shutdown", id);
                inner.shutdown_requested.cancel();
            }
        }
    }
}
