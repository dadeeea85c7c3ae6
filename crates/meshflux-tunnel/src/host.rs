//! The OS packet-tunnel provider as seen from inside the tunnel process

use crate::error::Result;
use crate::settings::TunnelNetworkSettings;
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// OS operations available to the tunnel process
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelHost: Send + Sync {
    /// Apply (or with `None`, clear) the tunnel network settings.
    ///
    /// Resolves once the OS confirmed; a refusal is
    /// [`TunnelError::OsSettingsRejected`](crate::TunnelError::OsSettingsRejected).
    async fn set_tunnel_network_settings(
        &self,
        settings: Option<TunnelNetworkSettings>,
    ) -> Result<()>;

    /// Descriptor of the tunnel device, once settings have been applied
    fn tunnel_fd(&self) -> Option<i32>;
}
