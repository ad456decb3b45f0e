//! Bounded cache of idle connections to one endpoint.

use std::sync::Mutex;

use log::debug;

use crate::error::{IpcError, Result};
use crate::ipc::connection::{Connection, ConnectionConfig};
use crate::ipc::messages::Role;
use crate::ipc::transport::Endpoint;

/// Default number of idle connections kept.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Pool of reusable connections.
///
/// Connections move in and out by value, so one connection can never sit in
/// the pool twice and the pool never touches a connection that is checked
/// out.
pub struct ConnectionPool {
    endpoint: Endpoint,
    role: Option<Role>,
    max_size: usize,
    config: ConnectionConfig,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    pub fn new(endpoint: Endpoint, max_size: usize, config: ConnectionConfig) -> Self {
        Self {
            endpoint,
            role: None,
            max_size,
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Pooled connections perform the CONNECT handshake as `role`.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Idle connections currently held.
    pub fn len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take an idle connection, revalidating it, or dial a new one.
    pub async fn acquire(&self) -> Result<Connection> {
        let reused = self
            .idle
            .lock()
            .map_err(|e| IpcError::ConnectionFailed(format!("pool lock poisoned: {}", e)))?
            .pop();

        let connection = match reused {
            Some(connection) if connection.is_connected() => {
                debug!("Reusing pooled connection to {}", self.endpoint);
                return Ok(connection);
            }
            Some(connection) => {
                debug!("Pooled connection to {} went stale, redialing", self.endpoint);
                connection
            }
            None => Connection::new(self.config.clone()),
        };

        self.dial(&connection).await?;
        Ok(connection)
    }

    /// Return a connection; it is closed if the pool is full.
    pub fn release(&self, connection: Connection) {
        let Ok(mut idle) = self.idle.lock() else {
            return;
        };
        if idle.len() < self.max_size {
            idle.push(connection);
        } else {
            debug!("Pool for {} full, closing connection", self.endpoint);
            drop(idle);
            drop(connection);
        }
    }

    /// Close every idle connection.
    pub fn clear(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }

    async fn dial(&self, connection: &Connection) -> Result<()> {
        match self.role {
            Some(role) => connection.connect_as(&self.endpoint, role).await,
            None => connection.connect(&self.endpoint).await,
        }
    }
}
