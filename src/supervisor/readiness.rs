//! Readiness signals from launched children.
//!
//! Two paths are supported:
//! - a stdout line `PORT=<n>` scanned by the supervisor
//! - an `Announce` frame sent to the supervisor's announcement socket and
//!   fanned out to subscribers through an [`AnnouncementBus`]

use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::ipc::frame::{DEFAULT_MAX_FRAME_LENGTH, read_frame};
use crate::ipc::messages::{Announce, Message};
use crate::ipc::transport::{Endpoint, Transport, TransportListener};

const BUS_CAPACITY: usize = 64;

/// Parse `<prefix><port>` from one stdout line.
pub fn parse_port_line(line: &str, prefix: &str) -> Option<u16> {
    line.trim()
        .strip_prefix(prefix)
        .and_then(|rest| rest.trim().parse::<u16>().ok())
        .filter(|port| *port != 0)
}

/// Typed fan-out of readiness announcements.
#[derive(Debug, Clone)]
pub struct AnnouncementBus {
    sender: broadcast::Sender<Announce>,
}

impl AnnouncementBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Announce> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers reached.
    pub fn publish(&self, announce: Announce) -> usize {
        self.sender.send(announce).unwrap_or(0)
    }
}

impl Default for AnnouncementBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait on a subscription for the announcement from `name`.
pub async fn next_announcement_from(receiver: &mut broadcast::Receiver<Announce>, name: &str) -> Result<Announce> {
    loop {
        match receiver.recv().await {
            Ok(announce) if announce.name == name => return Ok(announce),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Announcement subscriber lagged by {}", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return Err(IpcError::Closed),
        }
    }
}

/// Unix socket that receives `Announce` frames and publishes them.
pub struct AnnouncementListener {
    listener: TransportListener,
    path: PathBuf,
    bus: AnnouncementBus,
}

impl AnnouncementListener {
    pub async fn bind(path: impl Into<PathBuf>, bus: AnnouncementBus) -> Result<Self> {
        let path = path.into();
        let listener = TransportListener::bind(&Endpoint::Unix(path.clone())).await?;
        Ok(Self { listener, path, bus })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept announcers until `stop` is cancelled.
    pub async fn run(self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(transport) => {
                        let bus = self.bus.clone();
                        tokio::spawn(read_announcements(transport, bus));
                    }
                    Err(e) => warn!("Announcement accept error: {}", e),
                }
            }
        }
    }
}

async fn read_announcements(transport: Transport, bus: AnnouncementBus) {
    let (mut reader, _writer) = transport.into_split();
    loop {
        let frame = match read_frame(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await {
            Ok(frame) => frame,
            Err(IpcError::Closed) => return,
            Err(e) => {
                warn!("Bad announcement stream: {}", e);
                return;
            }
        };
        match Announce::from_frame(&frame) {
            Ok(announce) => {
                debug!("Announcement from {} on port {}", announce.name, announce.port);
                bus.publish(announce);
            }
            Err(e) => warn!("Ignoring frame on announcement socket: {}", e),
        }
    }
}

/// Send one readiness announcement to a supervisor.
pub async fn announce(path: &Path, announce: &Announce) -> Result<()> {
    let mut transport = Transport::connect(&Endpoint::Unix(path.to_path_buf())).await?;
    transport.send(&announce.to_frame()?.encode()?).await
}
