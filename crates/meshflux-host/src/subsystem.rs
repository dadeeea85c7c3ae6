//! The OS VPN subsystem as seen from the host application

use crate::error::SubsystemError;
use crate::profile::TunnelProfile;
use crate::status::ConnectionStatus;
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A profile stored in the OS preferences together with its connection status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProfile {
    pub profile: TunnelProfile,
    pub status: ConnectionStatus,
}

pub type SubsystemResult<T> = std::result::Result<T, SubsystemError>;

/// OS VPN preferences and connection control
#[async_trait]
pub trait VpnSubsystem: Send + Sync {
    /// Every profile this application installed
    async fn load_profiles(&self) -> SubsystemResult<Vec<InstalledProfile>>;

    /// Insert or replace the profile with the same id
    async fn save_profile(&self, profile: &TunnelProfile) -> SubsystemResult<()>;

    /// Ask the OS to start the tunnel; completion arrives as status changes
    async fn start_tunnel(&self, id: Uuid) -> SubsystemResult<()>;

    /// Ask the OS to stop the tunnel; completion arrives as status changes
    async fn stop_tunnel(&self, id: Uuid) -> SubsystemResult<()>;

    fn status(&self, id: Uuid) -> ConnectionStatus;

    /// Status changes of one profile's connection, in OS order
    fn subscribe_status(&self, id: Uuid) -> broadcast::Receiver<ConnectionStatus>;

    /// Reason for the most recent disconnect, if the OS recorded one
    async fn last_disconnect_error(&self, id: Uuid) -> Option<String>;

    /// Deliver a message to the running tunnel provider and return its reply
    async fn send_provider_message(&self, id: Uuid, message: Vec<u8>) -> SubsystemResult<Vec<u8>>;
}
