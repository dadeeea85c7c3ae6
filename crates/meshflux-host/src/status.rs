//! VPN connection status as published to the application

use serde::{Deserialize, Serialize};

/// Status of the OS VPN connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Reasserting,
    Disconnecting,
}

impl ConnectionStatus {
    pub fn is_connecting(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Reasserting)
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }

    /// Any state in which the tunnel process exists
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected
                | ConnectionStatus::Connecting
                | ConnectionStatus::Reasserting
                | ConnectionStatus::Disconnecting
        )
    }

    /// No tunnel is running or about to run
    pub fn is_down(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Invalid
        )
    }
}

/// State the application renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub is_connected: bool,
    pub is_connecting: bool,
}

impl ConnectionState {
    pub fn from_status(status: ConnectionStatus) -> Self {
        Self {
            status,
            is_connected: status.is_connected(),
            is_connecting: status.is_connecting(),
        }
    }
}
