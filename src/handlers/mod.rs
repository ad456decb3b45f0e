//! Role handlers served by the helper and backend processes
//!
//! - `mounts`: the mount table and disk types
//! - `backend`: mount management requests
//! - `helper`: relays mount status updates to user-facing clients

pub mod backend;
pub mod helper;
pub mod mounts;

pub use backend::{BackendHandler, BackendHandlerFactory};
pub use helper::{HelperHandlerFactory, StatusHub};
pub use mounts::{DISK_TYPES, MountError, MountRegistry, disk_types};

use crate::ipc::messages::ShutdownResponse;
use crate::ipc::server::Dispatch;

/// Acknowledge a shutdown request and stop the server once it is sent.
pub(crate) fn shutdown_reply(message: &str) -> Dispatch {
    match Dispatch::reply(&ShutdownResponse::ok(message)) {
        Dispatch::Reply(frames) => Dispatch::Shutdown(frames),
        _ => Dispatch::Shutdown(Vec::new()),
    }
}
