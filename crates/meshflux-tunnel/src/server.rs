//! Command server
//!
//! Owns the running engine service and the local command channel. The
//! channel accepts [`IpcRequest`]s on `<base>/command.sock`; engine-side
//! callbacks go through the [`PlatformBridge`] it hands to the engine.

use crate::config::ConfigSource;
use crate::engine::{Engine, EngineService, OverrideOptions, PlatformInterface};
use crate::error::{Result, TunnelError};
use crate::platform::PlatformBridge;
use crate::settings::TunnelNetworkSettings;
use meshflux_proto::{
    IpcConnection, IpcRequest, IpcResponse, IpcServer, ServiceStatusInfo, SettingsSummary,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub struct CommandServer {
    engine: Arc<dyn Engine>,
    platform: Arc<PlatformBridge>,
    socket_path: PathBuf,
    config: ConfigSource,
    /// Held for the whole start/reload/close of the service
    service: Mutex<Option<Box<dyn EngineService>>>,
    service_running: AtomicBool,
    /// Set once by `close`; a closed server never runs the service again
    closed: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CommandServer {
    pub fn new(
        engine: Arc<dyn Engine>,
        platform: Arc<PlatformBridge>,
        socket_path: PathBuf,
        config: ConfigSource,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            platform,
            socket_path,
            config,
            service: Mutex::new(None),
            service_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listener: Mutex::new(None),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn platform(&self) -> &Arc<PlatformBridge> {
        &self.platform
    }

    /// Bind the command socket and start accepting controllers.
    ///
    /// Fails with [`TunnelError::ServerStartFailed`] when the socket cannot
    /// be bound; a later retry may succeed. Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::ServerClosed);
        }
        if self.is_listening() {
            return Ok(());
        }

        let ipc = IpcServer::bind_to(&self.socket_path)
            .await
            .map_err(|e| TunnelError::ServerStartFailed(format!("{:#}", e)))?;

        info!("Command server listening on {:?}", ipc.path());

        let task = tokio::spawn(Self::run_accept_loop(ipc, Arc::downgrade(self)));
        *self.listener_guard() = Some(task);
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listener_guard()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn is_service_running(&self) -> bool {
        self.service_running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start the engine service, or reload it in place when one is running.
    ///
    /// Blocks; the engine may call `open_tun` before this returns.
    /// Configuration errors are returned unchanged and leave any running
    /// service untouched. Fails with [`TunnelError::ServerClosed`] once the
    /// server was closed.
    pub fn start_or_reload_service(&self, config: &str, overrides: &OverrideOptions) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(config)
            .map_err(|e| TunnelError::ConfigInvalid(e.to_string()))?;

        let mut service = self.service.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the service lock so `close` cannot slip in between
        if self.is_closed() {
            return Err(TunnelError::ServerClosed);
        }
        match service.as_mut() {
            Some(running) => {
                running.reload(config, overrides)?;
                info!("Engine service reloaded");
            }
            None => {
                let platform: Arc<dyn PlatformInterface> = self.platform.clone();
                let started = self.engine.start_service(config, overrides, platform)?;
                *service = Some(started);
                self.service_running.store(true, Ordering::SeqCst);
                info!("Engine service started");
            }
        }
        Ok(())
    }

    /// Close the engine service. No-op when none is running.
    pub fn close_service(&self) -> Result<()> {
        let service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.service_running.store(false, Ordering::SeqCst);

        match service {
            Some(mut service) => {
                service.close()?;
                info!("Engine service closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Stop accepting controllers, drop every open connection and remove
    /// the socket.
    ///
    /// A service started by a request that was still in flight is closed
    /// as well. Once this returns the service stays down. No-op when closed.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let task = self.listener_guard().take();
        if let Some(task) = task {
            // Aborting the accept loop drops its connection tasks too
            task.abort();
            // Wait for the listener to drop so its socket is gone before we return
            let _ = task.await;
        }

        let server = self.clone();
        match tokio::task::spawn_blocking(move || server.close_service()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to close engine service: {}", e),
            Err(e) => warn!("Engine service close task failed: {}", e),
        }
        info!("Command server closed");
    }

    /// Rebuild the configuration and apply it to the service
    pub fn service_reload(&self) -> Result<()> {
        let (config, _) = self.config.load()?;
        self.start_or_reload_service(&config, &OverrideOptions::default())
    }

    pub fn service_stop(&self) -> Result<()> {
        self.close_service()
    }

    pub fn status(&self) -> ServiceStatusInfo {
        let proxy = self.platform.get_system_proxy_status();
        ServiceStatusInfo {
            service_running: self.is_service_running(),
            settings: self.platform.applied_settings().as_ref().map(summarize),
            proxy_available: proxy.available,
            proxy_enabled: proxy.enabled,
        }
    }

    fn listener_guard(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_accept_loop(ipc: IpcServer, server: Weak<Self>) {
        // Owned here so aborting the loop aborts every connection
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = ipc.accept() => match accepted {
                    Ok(conn) => {
                        connections.spawn(Self::serve_connection(conn, server.clone()));
                    }
                    Err(e) => {
                        error!("Command socket accept error: {}", e);
                        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    async fn serve_connection(mut conn: IpcConnection, server: Weak<Self>) {
        loop {
            let request = match conn.recv().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!("Command channel recv error: {}", e);
                    break;
                }
            };

            debug!("Command request: {:?}", request);
            let response = match server.upgrade() {
                Some(server) if !server.is_closed() => server.handle_request(request).await,
                _ => IpcResponse::Error {
                    message: "Command server is shutting down".to_string(),
                },
            };

            if let Err(e) = conn.send(&response).await {
                warn!("Command channel send error: {}", e);
                break;
            }
        }
    }

    async fn handle_request(self: Arc<Self>, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,

            IpcRequest::Status => IpcResponse::Status(self.status()),

            IpcRequest::Reload => {
                let server = self.clone();
                Self::blocking(move || server.service_reload(), "Service reloaded").await
            }

            IpcRequest::StopService => {
                let server = self.clone();
                Self::blocking(move || server.service_stop(), "Service stopped").await
            }

            IpcRequest::GetSystemProxy => self.proxy_response(),

            IpcRequest::SetSystemProxy { enabled } => {
                let platform = self.platform.clone();
                let result =
                    tokio::task::spawn_blocking(move || platform.set_system_proxy_enabled(enabled))
                        .await;
                match result {
                    Ok(Ok(())) => self.proxy_response(),
                    Ok(Err(e)) => IpcResponse::Error {
                        message: e.to_string(),
                    },
                    Err(e) => IpcResponse::Error {
                        message: format!("Task failed: {}", e),
                    },
                }
            }
        }
    }

    fn proxy_response(&self) -> IpcResponse {
        let status = self.platform.get_system_proxy_status();
        IpcResponse::SystemProxy {
            available: status.available,
            enabled: status.enabled,
        }
    }

    /// Run a blocking service operation off the async workers
    async fn blocking<F>(operation: F, done: &str) -> IpcResponse
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        match tokio::task::spawn_blocking(operation).await {
            Ok(Ok(())) => IpcResponse::Ok {
                message: Some(done.to_string()),
            },
            Ok(Err(e)) => {
                warn!("{}", e);
                IpcResponse::Error {
                    message: e.to_string(),
                }
            }
            Err(e) => IpcResponse::Error {
                message: format!("Task failed: {}", e),
            },
        }
    }
}

fn summarize(settings: &TunnelNetworkSettings) -> SettingsSummary {
    let mut summary = SettingsSummary {
        mtu: settings.mtu,
        dns_servers: settings
            .dns
            .as_ref()
            .map(|dns| dns.servers.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default(),
        http_proxy: settings
            .proxy
            .as_ref()
            .map(|p| format!("{}:{}", p.http_server.address, p.http_server.port)),
        ..Default::default()
    };

    if let Some(ipv4) = &settings.ipv4 {
        summary.ipv4_addresses = ipv4
            .addresses
            .iter()
            .zip(&ipv4.subnet_masks)
            .map(|(addr, mask)| format!("{}/{}", addr, u32::from(*mask).count_ones()))
            .collect();
        summary.included_routes += ipv4.included_routes.len();
        summary.excluded_routes += ipv4.excluded_routes.len();
    }

    if let Some(ipv6) = &settings.ipv6 {
        summary.ipv6_addresses = ipv6
            .addresses
            .iter()
            .zip(&ipv6.prefix_lengths)
            .map(|(addr, prefix)| format!("{}/{}", addr, prefix))
            .collect();
        summary.included_routes += ipv6.included_routes.len();
        summary.excluded_routes += ipv6.excluded_routes.len();
    }

    summary
}
