//! IPC layer shared by the app, the helper and the backend
//!
//! This module provides:
//! - Length-prefixed, tagged frames and their codec
//! - Typed message schema with one response per request
//! - TCP-loopback and Unix-domain transports
//! - Client connections with reconnect and a bounded pool
//! - Role-dispatching message server and the shutdown control socket

pub mod connection;
pub mod control;
pub mod frame;
pub mod messages;
pub mod pool;
pub mod server;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, ConnectionState, ReconnectHook, redial_hook};
pub use control::{ControlServer, LEGACY_SHUTDOWN_BYTE, request_shutdown};
pub use frame::{DEFAULT_MAX_FRAME_LENGTH, Frame, FrameCodec, encode, read_frame};
pub use messages::{Message, MessageType, Request, Role};
pub use pool::{ConnectionPool, DEFAULT_POOL_SIZE};
pub use server::{ClientHandle, ClientId, Dispatch, HandlerFactory, MessageServer, RoleHandler, ServerConfig};
pub use transport::{Endpoint, Transport, TransportListener, TransportReader, TransportWriter};
