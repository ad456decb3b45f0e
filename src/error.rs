//! Error types for the IPC fabric
//!
//! Centralized error handling using thiserror. Variants are grouped the way
//! callers react to them: transport and connection-loss errors are recovered
//! by reconnecting, protocol errors close the offending socket, process
//! errors surface from the supervisor.

use std::time::Duration;

use thiserror::Error;

/// All error types that can occur in the IPC fabric
#[derive(Debug, Error)]
pub enum IpcError {
    // Transport
    /// Peer closed the stream before the requested bytes arrived
    #[error("Short read: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    /// Peer closed the stream cleanly between frames
    #[error("Connection closed by peer")]
    Closed,

    /// Writing to the stream failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    // Protocol
    /// Wire tag outside the known message set
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Length prefix below the one-byte minimum
    #[error("Invalid frame length: {0}")]
    InvalidLength(u32),

    /// Length prefix above the configured maximum
    #[error("Frame too large: {length} > {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// A frame arrived with a tag other than the one the caller waits for
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    /// Payload could not be decoded into the expected message
    #[error("Decode error: {0}")]
    Decode(String),

    /// CONNECT handshake rejected or malformed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    // Connection
    /// Operation attempted without a live connection
    #[error("Not connected")]
    NotConnected,

    /// Dial attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped while a request was outstanding
    #[error("Connection lost")]
    ConnectionLost,

    /// Operation did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Operation aborted by its cancellation token
    #[error("Cancelled")]
    Cancelled,

    // Process
    /// Managed executable missing from the installation
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    /// Config directory missing and could not be created
    #[error("Invalid config directory: {0}")]
    InvalidConfigDirectory(String),

    /// Start requested for a process that is launching or running
    #[error("Process already running: {0}")]
    AlreadyRunning(String),

    /// Stop requested for a process that is not running
    #[error("Process not running: {0}")]
    NotRunning(String),

    /// Name not registered with the supervisor
    #[error("Unknown process: {0}")]
    UnknownProcess(String),

    /// Spawning the child failed
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// Child did not report readiness in time
    #[error("Startup timeout: {0}")]
    StartupTimeout(String),

    /// Child could not be terminated
    #[error("Termination failed: {0}")]
    TerminationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IpcError {
    /// Errors raised by the byte stream itself
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            IpcError::ShortRead { .. } | IpcError::Closed | IpcError::SendFailed(_) | IpcError::Io(_)
        )
    }

    /// Errors that mean the peer spoke the protocol wrong
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            IpcError::UnknownMessageType(_)
                | IpcError::InvalidLength(_)
                | IpcError::FrameTooLarge { .. }
                | IpcError::UnexpectedMessage { .. }
                | IpcError::Decode(_)
                | IpcError::Handshake(_)
                | IpcError::Json(_)
        )
    }

    /// Errors a reconnect can fix
    pub fn is_recoverable(&self) -> bool {
        self.is_transport()
            || matches!(
                self,
                IpcError::NotConnected | IpcError::ConnectionLost | IpcError::ConnectionFailed(_)
            )
    }
}

/// Result type alias for IPC operations
pub type Result<T> = std::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_read_error() {
        let err = IpcError::ShortRead {
            expected: 4,
            received: 2,
        };
        assert_eq!(err.to_string(), "Short read: expected 4 bytes, got 2");
        assert!(err.is_transport());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_protocol_errors_are_not_recoverable() {
        let err = IpcError::UnknownMessageType(200);
        assert_eq!(err.to_string(), "Unknown message type: 200");
        assert!(err.is_protocol());
        assert!(!err.is_recoverable());

        let err = IpcError::InvalidLength(0);
        assert!(err.is_protocol());
    }

    #[test]
    fn test_connection_errors() {
        assert!(IpcError::NotConnected.is_recoverable());
        assert!(IpcError::ConnectionLost.is_recoverable());
        assert!(!IpcError::Cancelled.is_recoverable());
        assert!(!IpcError::Timeout(Duration::from_millis(500)).is_recoverable());
    }

    #[test]
    fn test_timeout_display() {
        let err = IpcError::Timeout(Duration::from_millis(500));
        assert_eq!(err.to_string(), "Timed out after 500ms");
    }

    #[test]
    fn test_process_errors() {
        let err = IpcError::AlreadyRunning("backend".to_string());
        assert_eq!(err.to_string(), "Process already running: backend");
        assert!(!err.is_transport());
        assert!(!err.is_protocol());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IpcError = io_err.into();
        assert!(matches!(err, IpcError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: IpcError = json_err.into();
        assert!(matches!(err, IpcError::Json(_)));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(IpcError::NotConnected)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
