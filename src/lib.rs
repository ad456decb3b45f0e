//! DiskJockey IPC - the process and messaging fabric between the app, the
//! helper and the backend.
//!
//! Frames are length-prefixed and tagged, carried over TCP loopback or Unix
//! sockets. Clients hold stateful connections with reconnect and a bounded
//! pool; servers dispatch per client role. The supervisor launches the
//! helper and backend, waits for their readiness, restarts them after
//! unexpected exits and shuts them down gracefully.

pub mod config;
pub mod error;
pub mod handlers;
pub mod ipc;
pub mod supervisor;

pub use error::{IpcError, Result};
