//! Contracts with the embedded routing engine
//!
//! The engine is opaque: it is set up once per process, runs a service from
//! a JSON configuration, and calls back into the OS layer through
//! [`PlatformInterface`] from its own threads.

use crate::error::Result;
use crate::monitor::{InterfaceUpdateListener, NetworkInterface};
use crate::settings::TunOptions;
use meshflux_proto::StorageLayout;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// Engine log ring size
pub const DEFAULT_LOG_MAX_LINES: usize = 2000;

/// Process-wide engine setup, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOptions {
    pub base_path: PathBuf,
    pub working_path: PathBuf,
    pub temp_path: PathBuf,
    pub log_max_lines: usize,
    pub debug: bool,
}

impl SetupOptions {
    pub fn from_layout(layout: &StorageLayout) -> Self {
        Self {
            base_path: layout.base_dir.clone(),
            working_path: layout.working_dir.clone(),
            temp_path: layout.temp_dir.clone(),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            debug: cfg!(debug_assertions),
        }
    }
}

/// Per-service overrides. Always passed explicitly, never omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideOptions {
    pub auto_redirect: bool,
}

/// Proxy state derived from the applied network settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SystemProxyStatus {
    pub available: bool,
    pub enabled: bool,
}

/// Connection whose owning process the engine wants to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOwnerRequest {
    pub ip_protocol: i32,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOwner {
    pub user_id: i32,
    pub user_name: String,
    pub process_path: String,
    pub package_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiState {
    pub ssid: String,
    pub bssid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub identifier: String,
    pub title: String,
    pub subtitle: String,
    pub body: String,
}

/// Callbacks the engine issues to the OS layer, from its own worker threads.
///
/// Every method may block; none may be called from inside an async task.
pub trait PlatformInterface: Send + Sync {
    /// Apply the tunnel's network settings and return the tunnel device handle
    fn open_tun(&self, options: &TunOptions) -> Result<i32>;

    /// Returns once `listener` received the first default-interface event
    fn start_default_interface_monitor(
        &self,
        listener: Arc<dyn InterfaceUpdateListener>,
    ) -> Result<()>;

    fn close_default_interface_monitor(&self) -> Result<()>;

    fn get_interfaces(&self) -> Result<Vec<NetworkInterface>>;

    fn get_system_proxy_status(&self) -> SystemProxyStatus;

    fn set_system_proxy_enabled(&self, enabled: bool) -> Result<()>;

    fn write_debug_message(&self, message: &str);

    fn find_connection_owner(&self, request: &ConnectionOwnerRequest) -> Result<ConnectionOwner>;

    /// Extra trusted roots; empty is a valid answer
    fn system_certificates(&self) -> Vec<String>;

    /// `None` when Wi-Fi state is unknown
    fn read_wifi_state(&self) -> Option<WifiState>;

    fn under_network_extension(&self) -> bool;

    fn include_all_networks(&self) -> bool;

    fn exclude_local_networks(&self) -> bool;

    fn use_proc_fs(&self) -> bool;

    fn use_platform_auto_detect_control(&self) -> bool;

    fn clear_dns_cache(&self);

    fn send_notification(&self, notification: &Notification) -> Result<()>;
}

/// A running engine service
pub trait EngineService: Send {
    /// Replace the running configuration in place
    fn reload(&mut self, config: &str, overrides: &OverrideOptions) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// The embedded routing engine
pub trait Engine: Send + Sync {
    /// Process-wide initialization. Not idempotent; see [`EngineContext`].
    fn setup(&self, options: &SetupOptions) -> Result<()>;

    fn redirect_stderr(&self, path: &Path) -> Result<()>;

    /// Parse `config` and start a service. May call back into `platform`
    /// (notably `open_tun`) before returning.
    fn start_service(
        &self,
        config: &str,
        overrides: &OverrideOptions,
        platform: Arc<dyn PlatformInterface>,
    ) -> Result<Box<dyn EngineService>>;

    /// Engine-side scan for the tunnel device descriptor, `None` if not found
    fn find_tunnel_fd(&self) -> Option<i32>;
}

/// Owns the engine handle and its one-time setup
pub struct EngineContext {
    engine: Arc<dyn Engine>,
    setup: OnceCell<SetupOptions>,
}

impl EngineContext {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            setup: OnceCell::new(),
        }
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        self.engine.clone()
    }

    /// Run engine setup unless it already succeeded in this process.
    ///
    /// A failed setup leaves the context uninitialized so a later start can
    /// try again.
    pub async fn ensure_setup(&self, options: &SetupOptions) -> Result<()> {
        self.setup
            .get_or_try_init(|| async {
                self.engine.setup(options)?;
                info!("Engine initialized (base {:?})", options.base_path);
                Ok::<_, crate::error::TunnelError>(options.clone())
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.setup.initialized()
    }

    /// Options the engine was initialized with
    pub fn setup_options(&self) -> Option<&SetupOptions> {
        self.setup.get()
    }
}

/// Minimal configuration used when nothing else is supplied: one TUN inbound
/// with automatic routing and a direct outbound
pub fn default_config() -> serde_json::Value {
    serde_json::json!({
        "log": { "level": "info" },
        "inbounds": [
            {
                "type": "tun",
                "tag": "tun-in",
                "address": ["172.18.0.1/30", "fdfe:dcba:9876::1/126"],
                "auto_route": true,
                "strict_route": false,
                "stack": "system"
            }
        ],
        "outbounds": [
            { "type": "direct", "tag": "direct" }
        ],
        "route": {
            "final": "direct",
            "auto_detect_interface": true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        setups: AtomicUsize,
        fail_first: bool,
    }

    impl Engine for CountingEngine {
        fn setup(&self, _options: &SetupOptions) -> Result<()> {
            let n = self.setups.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(TunnelError::SetupFailed("first attempt".to_string()));
            }
            Ok(())
        }

        fn redirect_stderr(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn start_service(
            &self,
            _config: &str,
            _overrides: &OverrideOptions,
            _platform: Arc<dyn PlatformInterface>,
        ) -> Result<Box<dyn EngineService>> {
            Err(TunnelError::UnsupportedOperation("start_service"))
        }

        fn find_tunnel_fd(&self) -> Option<i32> {
            None
        }
    }

    fn options() -> SetupOptions {
        SetupOptions::from_layout(&StorageLayout::in_application_support(PathBuf::from(
            "/tmp/meshflux",
        )))
    }

    #[tokio::test]
    async fn test_setup_runs_once() {
        let engine = Arc::new(CountingEngine {
            setups: AtomicUsize::new(0),
            fail_first: false,
        });
        let context = EngineContext::new(engine.clone());

        context.ensure_setup(&options()).await.unwrap();
        context.ensure_setup(&options()).await.unwrap();

        assert_eq!(engine.setups.load(Ordering::SeqCst), 1);
        assert!(context.is_initialized());
        assert_eq!(context.setup_options().unwrap().log_max_lines, 2000);
    }

    #[tokio::test]
    async fn test_failed_setup_can_be_retried() {
        let engine = Arc::new(CountingEngine {
            setups: AtomicUsize::new(0),
            fail_first: true,
        });
        let context = EngineContext::new(engine.clone());

        assert!(matches!(
            context.ensure_setup(&options()).await,
            Err(TunnelError::SetupFailed(_))
        ));
        assert!(!context.is_initialized());

        context.ensure_setup(&options()).await.unwrap();
        assert_eq!(engine.setups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_setup_options_from_layout() {
        let options = options();
        assert_eq!(options.base_path, PathBuf::from("/tmp/meshflux"));
        assert_eq!(options.working_path, PathBuf::from("/tmp/meshflux/work"));
        assert_eq!(options.temp_path, PathBuf::from("/tmp/meshflux/tmp"));
    }

    #[test]
    fn test_default_config_shape() {
        let config = default_config();
        assert_eq!(config["inbounds"][0]["type"], "tun");
        assert_eq!(config["inbounds"][0]["auto_route"], true);
        assert_eq!(config["outbounds"][0]["type"], "direct");
        assert!(!OverrideOptions::default().auto_redirect);
    }
}
