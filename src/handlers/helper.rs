//! Helper role handlers.
//!
//! The helper sits between the backend and the user-facing clients. A
//! backend client publishes [`MountStatusUpdate`] events; every connected
//! app and file-provider client receives them as unsolicited frames.

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::handlers::shutdown_reply;
use crate::ipc::frame::Frame;
use crate::ipc::messages::{Message, MessageType, MountStatusUpdate, Role};
use crate::ipc::server::{ClientHandle, ClientId, Dispatch, HandlerFactory, RoleHandler};

const STATUS_CAPACITY: usize = 64;

/// Fan-out point for mount status updates.
#[derive(Debug, Clone)]
pub struct StatusHub {
    sender: broadcast::Sender<MountStatusUpdate>,
}

impl Default for StatusHub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(STATUS_CAPACITY);
        Self { sender }
    }
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MountStatusUpdate> {
        self.sender.subscribe()
    }

    /// Returns how many subscribers received the update.
    pub fn publish(&self, update: MountStatusUpdate) -> usize {
        self.sender.send(update).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HelperHandlerFactory {
    hub: StatusHub,
}

impl HelperHandlerFactory {
    pub fn new(hub: StatusHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &StatusHub {
        &self.hub
    }
}

impl HandlerFactory for HelperHandlerFactory {
    fn create(&self, client: &ClientHandle) -> Option<Box<dyn RoleHandler>> {
        match client.role {
            Role::Backend => Some(Box::new(BackendLink {
                hub: self.hub.clone(),
                client: client.id,
            })),
            Role::App | Role::FileProvider => Some(Box::new(Subscriber::start(client.clone(), self.hub.subscribe()))),
        }
    }
}

/// The backend's connection to the helper.
struct BackendLink {
    hub: StatusHub,
    client: ClientId,
}

#[async_trait]
impl RoleHandler for BackendLink {
    async fn handle(&mut self, frame: Frame) -> Dispatch {
        match frame.message_type() {
            Ok(MessageType::MountStatusUpdate) => {
                match MountStatusUpdate::from_frame(&frame) {
                    Ok(update) => {
                        let delivered = self.hub.publish(update.clone());
                        debug!(
                            "Mount {} is now {:?}, relayed to {} client(s)",
                            update.mount_id, update.status, delivered
                        );
                    }
                    Err(e) => warn!("Dropping bad status update from backend {}: {}", self.client, e),
                }
                Dispatch::NoReply
            }
            Ok(MessageType::ShutdownRequest) => shutdown_reply("helper shutting down"),
            _ => Dispatch::Unhandled,
        }
    }

    async fn closed(&mut self) {
        info!("Backend link {} closed", self.client);
    }
}

/// An app or file-provider client receiving status updates.
struct Subscriber {
    client: ClientId,
    stop: CancellationToken,
}

impl Subscriber {
    fn start(client: ClientHandle, updates: broadcast::Receiver<MountStatusUpdate>) -> Self {
        let stop = CancellationToken::new();
        tokio::spawn(forward_updates(client.clone(), updates, stop.clone()));
        Self { client: client.id, stop }
    }
}

async fn forward_updates(
    client: ClientHandle,
    mut updates: broadcast::Receiver<MountStatusUpdate>,
    stop: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = stop.cancelled() => break,
            update = updates.recv() => update,
        };
        match update {
            Ok(update) => {
                let Ok(frame) = update.to_frame() else { continue };
                if !client.push(frame) {
                    if client.is_closed() {
                        break;
                    }
                    warn!("Client {} is not keeping up, dropped a status update", client.id);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Client {} missed {} status updates", client.id, n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl RoleHandler for Subscriber {
    async fn handle(&mut self, frame: Frame) -> Dispatch {
        match frame.message_type() {
            Ok(MessageType::ShutdownRequest) => shutdown_reply("helper shutting down"),
            _ => Dispatch::Unhandled,
        }
    }

    async fn closed(&mut self) {
        debug!("Subscriber {} closed", self.client);
        self.stop.cancel();
    }
}
