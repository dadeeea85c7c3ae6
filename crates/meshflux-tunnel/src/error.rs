//! Tunnel-side errors

use thiserror::Error;

/// Errors raised while starting, running or driving the packet tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The embedded engine refused to initialize
    #[error("Engine setup failed: {0}")]
    SetupFailed(String),

    #[error("No writable shared container or application support directory")]
    StorageUnavailable,

    /// The command channel could not bind; retrying later may succeed
    #[error("Command server failed to start: {0}")]
    ServerStartFailed(String),

    #[error("Command server is closed")]
    ServerClosed,

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Tunnel device handle unavailable after applying network settings")]
    MissingTunnelHandle,

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Network settings rejected: {0}")]
    OsSettingsRejected(String),

    #[error("Invalid tunnel options: {0}")]
    InvalidTunOptions(String),

    /// A bridged operation ended without producing a result
    #[error("Bridged operation aborted before completing")]
    BridgeAborted,

    #[error("File watch failed: {0}")]
    WatchFailed(String),

    #[error("Command socket path is {len} bytes, limit is {max}")]
    SocketPathTooLong { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TunnelError::SocketPathTooLong { len: 120, max: 103 };
        assert_eq!(
            err.to_string(),
            "Command socket path is 120 bytes, limit is 103"
        );

        let err = TunnelError::UnsupportedOperation("find_connection_owner");
        assert_eq!(
            err.to_string(),
            "Unsupported operation: find_connection_owner"
        );
    }
}
