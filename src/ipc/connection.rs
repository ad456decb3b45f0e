//! Client-side connection with an explicit state machine.
//!
//! Provides:
//! - `connect` / `connect_as` (connect + CONNECT handshake), both idempotent
//! - typed `request` with timeout and cancellation
//! - a reconnect hook consulted when an operation finds the connection down
//! - an event channel for frames nobody asked for
//!
//! Frames carry no request id, so a connection allows one outstanding
//! request at a time: requests are serialized by a lock and the reader task
//! hands the next frame with the expected tag to the single pending slot.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::ipc::frame::{DEFAULT_MAX_FRAME_LENGTH, Frame, read_frame};
use crate::ipc::messages::{ConnectRequest, ConnectResponse, Message, MessageType, Request, Role, describe_tag};
use crate::ipc::transport::{Endpoint, Transport, TransportReader, TransportWriter};

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on a single dial attempt.
    pub connect_timeout: Duration,
    /// Default bound on waiting for a response.
    pub request_timeout: Duration,
    /// How often to look at the state after invoking the reconnect hook.
    pub reconnect_poll_interval: Duration,
    /// How long to wait for the reconnect hook to bring the connection up.
    pub reconnect_timeout: Duration,
    /// Unsolicited frames buffered before new ones are dropped.
    pub event_capacity: usize,
    pub max_frame_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            reconnect_poll_interval: Duration::from_millis(200),
            reconnect_timeout: Duration::from_secs(10),
            event_capacity: 100,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Connectivity as observers see it.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(Endpoint),
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

// Any two failures compare equal; the cause is informational.
impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConnectionState::Disconnected, ConnectionState::Disconnected) => true,
            (ConnectionState::Connecting, ConnectionState::Connecting) => true,
            (ConnectionState::Connected(a), ConnectionState::Connected(b)) => a == b,
            (ConnectionState::Failed(_), ConnectionState::Failed(_)) => true,
            _ => false,
        }
    }
}

impl Eq for ConnectionState {}

/// Callback that tries to bring a connection back up.
///
/// It is spawned, not awaited: the connection polls its own state
/// afterwards to decide whether the retry can go ahead.
pub type ReconnectHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Request awaiting its response frame.
struct PendingRequest {
    expected: MessageType,
    sender: oneshot::Sender<Result<Frame>>,
}

/// State shared with the reader task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    pending: Mutex<Option<PendingRequest>>,
    generation: AtomicU64,
    events: mpsc::Sender<Frame>,
}

impl Shared {
    async fn fail_pending(&self, error: IpcError) {
        if let Some(request) = self.pending.lock().await.take() {
            let _ = request.sender.send(Err(error));
        }
    }

    /// Route one inbound frame to the pending request or the event channel.
    async fn dispatch(&self, frame: Frame) {
        let mut slot = self.pending.lock().await;
        let expected = slot.as_ref().map(|p| p.expected);

        match expected {
            Some(expected) if expected.tag() == frame.tag => {
                if let Some(request) = slot.take() {
                    let _ = request.sender.send(Ok(frame));
                }
            }
            Some(expected) if !is_event_tag(frame.tag) => {
                // Peer answered something we did not ask for
                if let Some(request) = slot.take() {
                    let _ = request.sender.send(Err(IpcError::UnexpectedMessage {
                        expected: expected.to_string(),
                        actual: describe_tag(frame.tag),
                    }));
                }
            }
            _ => {
                drop(slot);
                debug!("Unsolicited frame: {}", frame.describe());
                if let Err(e) = self.events.try_send(frame) {
                    warn!("Dropping unsolicited frame: {}", e);
                }
            }
        }
    }
}

fn is_event_tag(tag: u8) -> bool {
    MessageType::try_from(tag).map(|t| t.is_event()).unwrap_or(false)
}

/// One client-side endpoint.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    writer: Mutex<Option<TransportWriter>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    request_lock: Mutex<()>,
    event_receiver: Mutex<mpsc::Receiver<Frame>>,
    endpoint: Mutex<Option<Endpoint>>,
    role: Mutex<Option<Role>>,
    reconnect: Mutex<Option<ReconnectHook>>,
}

impl Connection {
    /// Create a disconnected connection.
    pub fn new(config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, event_receiver) = mpsc::channel(config.event_capacity.max(1));
        Self {
            config,
            shared: Arc::new(Shared {
                state,
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            request_lock: Mutex::new(()),
            event_receiver: Mutex::new(event_receiver),
            endpoint: Mutex::new(None),
            role: Mutex::new(None),
            reconnect: Mutex::new(None),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(ConnectionConfig::default())
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }

    /// Endpoint of the most recent connect attempt.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().await.clone()
    }

    /// Role asserted by the last `connect_as` or `handshake`.
    pub async fn role(&self) -> Option<Role> {
        *self.role.lock().await
    }

    /// Install the hook used when an operation finds the connection down.
    pub async fn set_reconnect_hook(&self, hook: ReconnectHook) {
        *self.reconnect.lock().await = Some(hook);
    }

    pub async fn clear_reconnect_hook(&self) {
        *self.reconnect.lock().await = None;
    }

    /// Connect to an endpoint, tearing down any existing socket first.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.connect_with_cancel(endpoint, &CancellationToken::new()).await
    }

    /// Connect, abortable through `cancel`.
    ///
    /// Cancellation drops the in-flight dial and leaves the connection
    /// `Disconnected`.
    pub async fn connect_with_cancel(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> Result<()> {
        self.establish(endpoint, None, cancel).await
    }

    /// Connect and assert a role before reporting `Connected`.
    pub async fn connect_as(&self, endpoint: &Endpoint, role: Role) -> Result<()> {
        self.connect_as_with_cancel(endpoint, role, &CancellationToken::new()).await
    }

    /// Connect and handshake, abortable through `cancel` during either the
    /// dial or the wait for the CONNECT reply.
    pub async fn connect_as_with_cancel(&self, endpoint: &Endpoint, role: Role, cancel: &CancellationToken) -> Result<()> {
        self.establish(endpoint, Some(role), cancel).await
    }

    /// Send CONNECT{role} on an already connected socket.
    pub async fn handshake(&self, role: Role) -> Result<()> {
        let _guard = self.request_lock.lock().await;
        if !self.is_connected() {
            return Err(IpcError::NotConnected);
        }
        self.handshake_locked(role, None).await
    }

    async fn handshake_locked(&self, role: Role, cancel: Option<&CancellationToken>) -> Result<()> {
        let request = ConnectRequest { role };
        let frame = self
            .round_trip(&request.to_frame()?, MessageType::Connect, self.config.request_timeout, cancel)
            .await?;
        let response = ConnectResponse::from_frame(&frame)?;
        if !response.is_success() {
            return Err(IpcError::Handshake(response.error));
        }
        *self.role.lock().await = Some(role);
        debug!("Handshake complete as {}", role);
        Ok(())
    }

    async fn establish(&self, endpoint: &Endpoint, role: Option<Role>, cancel: &CancellationToken) -> Result<()> {
        self.teardown(ConnectionState::Connecting).await;
        *self.endpoint.lock().await = Some(endpoint.clone());
        // Kept even if the dial fails so a later reconnect asserts the same role.
        *self.role.lock().await = role;
        debug!("Connecting to {}", endpoint);

        let dial = tokio::time::timeout(self.config.connect_timeout, Transport::connect(endpoint));
        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.shared.state.send_replace(ConnectionState::Disconnected);
                return Err(IpcError::Cancelled);
            }
            result = dial => match result {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    warn!("Connect to {} failed: {}", endpoint, e);
                    self.shared.state.send_replace(ConnectionState::Failed(e.to_string()));
                    return Err(e);
                }
                Err(_) => {
                    warn!("Connect to {} timed out", endpoint);
                    self.shared
                        .state
                        .send_replace(ConnectionState::Failed("connect timed out".to_string()));
                    return Err(IpcError::Timeout(self.config.connect_timeout));
                }
            }
        };

        self.install(transport).await;

        if let Some(role) = role {
            let _guard = self.request_lock.lock().await;
            match self.handshake_locked(role, Some(cancel)).await {
                Ok(()) => {}
                // Already torn down to Disconnected
                Err(IpcError::Cancelled) => return Err(IpcError::Cancelled),
                Err(e) => {
                    warn!("Handshake with {} failed: {}", endpoint, e);
                    self.teardown(ConnectionState::Failed(e.to_string())).await;
                    return Err(e);
                }
            }
        }

        self.shared
            .state
            .send_replace(ConnectionState::Connected(endpoint.clone()));
        info!("Connected to {}", endpoint);
        Ok(())
    }

    /// Redial the last endpoint and repeat the last handshake.
    pub async fn reconnect(&self) -> Result<()> {
        let endpoint = self.endpoint().await.ok_or(IpcError::NotConnected)?;
        let role = self.role().await;
        match role {
            Some(role) => self.connect_as(&endpoint, role).await,
            None => self.connect(&endpoint).await,
        }
    }

    /// Close the socket; a pending request fails with `ConnectionLost`.
    pub async fn disconnect(&self) {
        self.teardown(ConnectionState::Disconnected).await;
    }

    /// Send a typed request and wait for its typed response.
    pub async fn request<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.request_with_timeout(request, self.config.request_timeout).await
    }

    pub async fn request_with_timeout<R: Request>(&self, request: &R, timeout: Duration) -> Result<R::Response> {
        let frame = request.to_frame()?;
        let expected = <R::Response as Message>::TYPE;
        let reply = self
            .perform(|| self.exchange(&frame, expected, timeout, None))
            .await?;
        R::Response::from_frame(&reply)
    }

    /// Send a typed request, abortable through `cancel`.
    ///
    /// Cancellation closes the socket and moves the connection to
    /// `Disconnected`.
    pub async fn request_with_cancel<R: Request>(&self, request: &R, cancel: &CancellationToken) -> Result<R::Response> {
        let frame = request.to_frame()?;
        let expected = <R::Response as Message>::TYPE;
        let timeout = self.config.request_timeout;
        let reply = self
            .perform(|| self.exchange(&frame, expected, timeout, Some(cancel)))
            .await?;
        R::Response::from_frame(&reply)
    }

    /// Untyped request: send a raw frame and wait for a frame tagged `expected`.
    pub async fn request_frame(&self, frame: Frame, expected: MessageType) -> Result<Frame> {
        let timeout = self.config.request_timeout;
        self.perform(|| self.exchange(&frame, expected, timeout, None)).await
    }

    /// Send a frame without waiting for anything back.
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        let bytes = message.to_frame()?.encode()?;
        self.perform(|| self.write(&bytes)).await
    }

    /// Receive the next unsolicited frame.
    ///
    /// Events have a single consumer: a second `next_event` waits behind
    /// the first for the receiver.
    pub async fn next_event(&self) -> Option<Frame> {
        self.event_receiver.lock().await.recv().await
    }

    /// Take an unsolicited frame if one is buffered.
    ///
    /// Returns `None` without waiting while a `next_event` holds the receiver.
    pub async fn try_next_event(&self) -> Option<Frame> {
        self.event_receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Run `action`, going through the reconnect hook first if the
    /// connection is down.
    async fn perform<T, F, Fut>(&self, action: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_connected() {
            return action().await;
        }

        let hook = self.reconnect.lock().await.clone();
        let Some(hook) = hook else {
            return Err(IpcError::NotConnected);
        };

        info!("Connection down, invoking reconnect hook");
        let attempt = hook();
        tokio::spawn(async move {
            if let Err(e) = attempt.await {
                warn!("Reconnect hook failed: {}", e);
            }
        });

        if self.wait_until_connected(self.config.reconnect_timeout).await {
            action().await
        } else {
            warn!("Still not connected after {:?}", self.config.reconnect_timeout);
            Err(IpcError::NotConnected)
        }
    }

    async fn wait_until_connected(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.is_connected() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.reconnect_poll_interval).await;
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => w.send(bytes).await,
                None => Err(IpcError::NotConnected),
            }
        };
        if let Err(e) = &sent {
            warn!("Send failed: {}", e);
            self.teardown(ConnectionState::Disconnected).await;
        }
        sent
    }

    /// One request/response exchange under the request lock.
    async fn exchange(
        &self,
        frame: &Frame,
        expected: MessageType,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Frame> {
        let _guard = self.request_lock.lock().await;
        if !self.is_connected() {
            return Err(IpcError::NotConnected);
        }
        self.round_trip(frame, expected, timeout, cancel).await
    }

    /// Send `frame` and wait for the reply; caller holds the request lock.
    async fn round_trip(
        &self,
        frame: &Frame,
        expected: MessageType,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Frame> {
        let bytes = frame.encode()?;
        let (sender, receiver) = oneshot::channel();
        *self.shared.pending.lock().await = Some(PendingRequest { expected, sender });

        if let Err(e) = self.write(&bytes).await {
            self.shared.pending.lock().await.take();
            return Err(e);
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, receiver) => match result {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(IpcError::ConnectionLost),
                Err(_) => {
                    // Free the slot; a late reply lands on the event channel
                    self.shared.pending.lock().await.take();
                    warn!("Request {} timed out after {:?}", describe_tag(frame.tag), timeout);
                    Err(IpcError::Timeout(timeout))
                }
            },
            _ = cancelled => {
                debug!("Request {} cancelled", describe_tag(frame.tag));
                self.teardown(ConnectionState::Disconnected).await;
                Err(IpcError::Cancelled)
            }
        }
    }

    async fn install(&self, transport: Transport) {
        let (reader, writer) = transport.into_split();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.writer.lock().await = Some(writer);

        let shared = Arc::clone(&self.shared);
        let max = self.config.max_frame_length;
        let handle = tokio::spawn(read_loop(shared, reader, generation, max));
        *self.reader_task.lock().await = Some(handle);
    }

    /// Drop the socket, fail the pending request and publish `next`.
    async fn teardown(&self, next: ConnectionState) {
        // Invalidate the running reader before it can publish anything
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.close().await;
        }
        self.shared.fail_pending(IpcError::ConnectionLost).await;
        self.shared.state.send_replace(next);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Build a hook that redials a shared connection's last endpoint.
///
/// Holds only a weak reference so the hook does not keep the connection
/// alive.
pub fn redial_hook(connection: &Arc<Connection>) -> ReconnectHook {
    let weak = Arc::downgrade(connection);
    Arc::new(move || -> BoxFuture<'static, Result<()>> {
        let weak = weak.clone();
        Box::pin(async move {
            let connection = weak.upgrade().ok_or(IpcError::NotConnected)?;
            connection.reconnect().await
        })
    })
}

async fn read_loop(shared: Arc<Shared>, mut reader: TransportReader, generation: u64, max_frame_length: usize) {
    loop {
        match read_frame(&mut reader, max_frame_length).await {
            Ok(frame) => shared.dispatch(frame).await,
            Err(e) => {
                match &e {
                    IpcError::Closed => debug!("Peer closed connection"),
                    _ => warn!("Connection read failed: {}", e),
                }
                let mut slot = shared.pending.lock().await;
                if shared.generation.load(Ordering::SeqCst) == generation {
                    if let Some(request) = slot.take() {
                        let _ = request.sender.send(Err(IpcError::ConnectionLost));
                    }
                    shared.state.send_replace(ConnectionState::Disconnected);
                }
                break;
            }
        }
    }
}
