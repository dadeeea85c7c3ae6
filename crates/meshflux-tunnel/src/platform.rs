//! Engine platform interface backed by the OS packet-tunnel host
//!
//! [`PlatformBridge`] is the single writer of the applied network settings.
//! Engine callbacks arrive on engine threads and block on the async OS call
//! through a [`BlockingBridge`].

use crate::bridge::BlockingBridge;
use crate::engine::{
    ConnectionOwner, ConnectionOwnerRequest, Engine, Notification, PlatformInterface,
    SystemProxyStatus, WifiState,
};
use crate::error::{Result, TunnelError};
use crate::host::TunnelHost;
use crate::monitor::{InterfaceMonitor, InterfaceUpdateListener, NetworkInterface, PathMonitor};
use crate::settings::{self, TunOptions, TunnelNetworkSettings};
use meshflux_proto::SharedPreferences;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const HOST_MASK: Ipv4Addr = Ipv4Addr::BROADCAST;

pub struct PlatformBridge {
    host: Arc<dyn TunnelHost>,
    engine: Arc<dyn Engine>,
    bridge: BlockingBridge,
    monitor: InterfaceMonitor,
    preferences: SharedPreferences,
    /// Last settings the OS accepted. Locked only around reads and the final store.
    applied: Mutex<Option<TunnelNetworkSettings>>,
    /// Serializes settings applications (open_tun, proxy toggle)
    apply_lock: Mutex<()>,
}

impl PlatformBridge {
    pub fn new(
        host: Arc<dyn TunnelHost>,
        engine: Arc<dyn Engine>,
        path_monitor: Arc<dyn PathMonitor>,
        bridge: BlockingBridge,
        preferences: SharedPreferences,
    ) -> Self {
        Self {
            host,
            engine,
            bridge,
            monitor: InterfaceMonitor::new(path_monitor),
            preferences,
            applied: Mutex::new(None),
            apply_lock: Mutex::new(()),
        }
    }

    /// Copy of the currently applied settings
    pub fn applied_settings(&self) -> Option<TunnelNetworkSettings> {
        self.applied_guard().clone()
    }

    /// Apply fixed settings from an async context, bypassing the engine
    pub async fn apply_settings(&self, settings: TunnelNetworkSettings) -> Result<()> {
        self.host
            .set_tunnel_network_settings(Some(settings.clone()))
            .await?;
        *self.applied_guard() = Some(settings);
        Ok(())
    }

    /// Forget applied settings and stop interface monitoring
    pub fn reset(&self) {
        *self.applied_guard() = None;
        self.monitor.close();
    }

    fn applied_guard(&self) -> MutexGuard<'_, Option<TunnelNetworkSettings>> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply through the OS, blocking the calling engine thread
    fn apply_blocking(&self, settings: TunnelNetworkSettings) -> Result<()> {
        let host = self.host.clone();
        self.bridge
            .run(async move { host.set_tunnel_network_settings(Some(settings)).await })
    }

    fn warn_on_unusable_ipv4(settings: &TunnelNetworkSettings) {
        let Some(ipv4) = &settings.ipv4 else {
            if settings.dns.is_some() {
                warn!("No IPv4 address assigned to the tunnel, DNS hijacking will fail");
            }
            return;
        };

        if ipv4.subnet_masks.first() == Some(&HOST_MASK) {
            warn!("First IPv4 tunnel address is a /32, DNS hijacking will fail");
        }
    }
}

impl PlatformInterface for PlatformBridge {
    fn open_tun(&self, options: &TunOptions) -> Result<i32> {
        let _apply = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        info!(
            "Opening tunnel: auto_route={} mtu={} http_proxy={}",
            options.auto_route,
            options.mtu,
            options.http_proxy.is_some()
        );

        let settings = settings::translate(options)?;
        if options.auto_route {
            Self::warn_on_unusable_ipv4(&settings);
        }
        if let Some(ipv4) = &settings.ipv4 {
            debug!(
                "IPv4 routes: {} included, {} excluded",
                ipv4.included_routes.len(),
                ipv4.excluded_routes.len()
            );
        }

        self.apply_blocking(settings.clone())?;
        *self.applied_guard() = Some(settings);

        if let Some(fd) = self.host.tunnel_fd() {
            debug!("Tunnel fd {} from host", fd);
            return Ok(fd);
        }
        if let Some(fd) = self.engine.find_tunnel_fd() {
            debug!("Tunnel fd {} from engine scan", fd);
            return Ok(fd);
        }

        warn!("Network settings applied but no tunnel fd is available");
        Err(TunnelError::MissingTunnelHandle)
    }

    fn start_default_interface_monitor(
        &self,
        listener: Arc<dyn InterfaceUpdateListener>,
    ) -> Result<()> {
        self.monitor.start(listener)
    }

    fn close_default_interface_monitor(&self) -> Result<()> {
        self.monitor.close();
        Ok(())
    }

    fn get_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        Ok(self.monitor.interfaces())
    }

    fn get_system_proxy_status(&self) -> SystemProxyStatus {
        match self.applied_guard().as_ref().and_then(|s| s.proxy.as_ref()) {
            Some(proxy) => SystemProxyStatus {
                available: true,
                enabled: proxy.http_enabled,
            },
            None => SystemProxyStatus::default(),
        }
    }

    fn set_system_proxy_enabled(&self, enabled: bool) -> Result<()> {
        let _apply = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(mut settings) = self.applied_settings() else {
            return Ok(());
        };
        let Some(proxy) = settings.proxy.as_mut() else {
            return Ok(());
        };
        if proxy.http_enabled == enabled {
            return Ok(());
        }
        proxy.set_enabled(enabled);

        self.apply_blocking(settings.clone())?;
        *self.applied_guard() = Some(settings);
        info!("System proxy {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn write_debug_message(&self, message: &str) {
        if message.is_empty() {
            return;
        }
        debug!(target: "meshflux::engine", "{}", message);
    }

    fn find_connection_owner(&self, _request: &ConnectionOwnerRequest) -> Result<ConnectionOwner> {
        Err(TunnelError::UnsupportedOperation("find_connection_owner"))
    }

    fn system_certificates(&self) -> Vec<String> {
        Vec::new()
    }

    fn read_wifi_state(&self) -> Option<WifiState> {
        None
    }

    fn under_network_extension(&self) -> bool {
        true
    }

    fn include_all_networks(&self) -> bool {
        self.preferences.include_all_networks
    }

    fn exclude_local_networks(&self) -> bool {
        self.preferences.exclude_local_networks
    }

    fn use_proc_fs(&self) -> bool {
        false
    }

    fn use_platform_auto_detect_control(&self) -> bool {
        false
    }

    fn clear_dns_cache(&self) {}

    fn send_notification(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}
