//! Host-side errors

use thiserror::Error;

/// Failure reported by the OS VPN subsystem
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SubsystemError(pub String);

impl SubsystemError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced to the host application's UI layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("VPN setup failed: {0}")]
    ProfileLoadFailed(#[source] SubsystemError),

    #[error("VPN save failed: {0}")]
    ProfileSaveFailed(#[source] SubsystemError),

    #[error("Failed to start VPN: {0}")]
    TunnelStartFailed(#[source] SubsystemError),

    #[error("Failed to stop VPN: {0}")]
    TunnelStopFailed(#[source] SubsystemError),

    /// Reason the OS gave for the last disconnect after a start attempt
    #[error("VPN disconnected: {0}")]
    Disconnected(String),

    #[error("Tunnel did not accept the message: {0}")]
    ProviderMessageFailed(String),
}
