//! Packet-tunnel lifecycle
//!
//! `Idle -> Initializing -> Running -> Stopping -> Idle`. Start and stop hold
//! the same lock as the lifecycle state, so a stop issued while a start is
//! in flight waits for the start to finish.

use crate::bridge::BlockingBridge;
use crate::config::ConfigSource;
use crate::engine::{EngineContext, OverrideOptions, SetupOptions};
use crate::error::{Result, TunnelError};
use crate::host::TunnelHost;
use crate::monitor::PathMonitor;
use crate::platform::PlatformBridge;
use crate::rules::{store_rules_file, RulesFormat, RULES_JSON_FILE, RULES_TEXT_FILE};
use crate::server::CommandServer;
use crate::settings::{DnsSettings, Ipv4Settings, TunnelNetworkSettings};
use crate::watcher::{FileReloadWatcher, RELOAD_DEBOUNCE};
use meshflux_proto::paths::MAX_SOCKET_PATH_BYTES;
use meshflux_proto::{PlatformProfile, PreferencesStore, StorageLayout};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    Initializing,
    Running,
    Stopping,
}

/// How the tunnel carries traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelMode {
    /// The embedded engine owns the tunnel
    #[default]
    Engine,
    /// Fixed settings with no routes; traffic keeps using the default interface
    Bypass,
}

/// Parameters of one start request
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Engine configuration supplied by the host application
    pub config_payload: Option<String>,
    /// Routing rules (JSON or text) used instead of the rule files
    pub routing_rules: Option<String>,
}

/// Why the OS asked the tunnel to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    UserInitiated,
    ProviderFailed,
    NoNetworkAvailable,
    ConfigurationRemoved,
    Superseded,
    Other(String),
}

/// OS-facing collaborators of the controller
pub struct ProviderDependencies {
    pub host: Arc<dyn TunnelHost>,
    pub path_monitor: Arc<dyn PathMonitor>,
}

struct Session {
    layout: StorageLayout,
    platform: Arc<PlatformBridge>,
    server: Option<Arc<CommandServer>>,
    config: Option<ConfigSource>,
    watcher: Option<FileReloadWatcher>,
}

struct LifecycleState {
    phase: LifecyclePhase,
    session: Option<Session>,
}

/// Messages the host application sends to the running tunnel
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AppMessage {
    Reload,
    UpdateRules {
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct AppMessageReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub struct TunnelLifecycleController {
    context: EngineContext,
    profile: PlatformProfile,
    mode: TunnelMode,
    host: Arc<dyn TunnelHost>,
    path_monitor: Arc<dyn PathMonitor>,
    state: Mutex<LifecycleState>,
    phase_tx: watch::Sender<LifecyclePhase>,
}

impl TunnelLifecycleController {
    pub fn new(
        context: EngineContext,
        profile: PlatformProfile,
        mode: TunnelMode,
        dependencies: ProviderDependencies,
    ) -> Self {
        let (phase_tx, _) = watch::channel(LifecyclePhase::Idle);
        Self {
            context,
            profile,
            mode,
            host: dependencies.host,
            path_monitor: dependencies.path_monitor,
            state: Mutex::new(LifecycleState {
                phase: LifecyclePhase::Idle,
                session: None,
            }),
            phase_tx,
        }
    }

    pub fn mode(&self) -> TunnelMode {
        self.mode
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase_tx.subscribe()
    }

    pub fn engine_context(&self) -> &EngineContext {
        &self.context
    }

    /// Bring the tunnel up. On failure nothing stays started.
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.phase == LifecyclePhase::Running {
            warn!("Tunnel already running, ignoring start");
            return Ok(());
        }

        self.set_phase(&mut state, LifecyclePhase::Initializing);
        info!("Starting tunnel ({:?} mode)", self.mode);

        match self.start_session(&options).await {
            Ok(session) => {
                state.session = Some(session);
                self.set_phase(&mut state, LifecyclePhase::Running);
                info!("Tunnel started");
                Ok(())
            }
            Err(e) => {
                self.set_phase(&mut state, LifecyclePhase::Idle);
                error!("Tunnel start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Tear the tunnel down. Never fails; problems are logged.
    pub async fn stop(&self, reason: StopReason) {
        let mut state = self.state.lock().await;
        info!("Stopping tunnel: {:?}", reason);

        let Some(session) = state.session.take() else {
            self.set_phase(&mut state, LifecyclePhase::Idle);
            return;
        };

        self.set_phase(&mut state, LifecyclePhase::Stopping);
        Self::teardown(session).await;
        self.set_phase(&mut state, LifecyclePhase::Idle);
        info!("Tunnel stopped");
    }

    /// Rebuild the configuration and reload the running service in place
    pub async fn reload(&self) -> Result<()> {
        let state = self.state.lock().await;
        let session = state
            .session
            .as_ref()
            .ok_or(TunnelError::UnsupportedOperation("reload without a running tunnel"))?;

        let Some(server) = session.server.clone() else {
            debug!("Nothing to reload in bypass mode");
            return Ok(());
        };

        tokio::task::spawn_blocking(move || server.service_reload())
            .await
            .map_err(|_| TunnelError::BridgeAborted)?
    }

    /// Replace the routing rule file and reload.
    ///
    /// Invalid rules are rejected before anything is written. Rules injected
    /// at start are dropped so the new file applies.
    pub async fn update_rules(&self, format: RulesFormat, content: &str) -> Result<()> {
        {
            let state = self.state.lock().await;
            let session = state.session.as_ref().ok_or(TunnelError::UnsupportedOperation(
                "update_rules without a running tunnel",
            ))?;

            store_rules_file(&session.layout.shared_data_dir, format, content)?;
            if let Some(config) = &session.config {
                config.clear_rules_override();
            }
        }
        self.reload().await
    }

    /// Handle a message from the host application. Unknown messages are echoed.
    pub async fn handle_app_message(&self, data: &[u8]) -> Vec<u8> {
        let Ok(message) = serde_json::from_slice::<AppMessage>(data) else {
            return data.to_vec();
        };

        let reply = match message {
            AppMessage::Reload => AppMessageReply::from(self.reload().await),
            AppMessage::UpdateRules {
                format: Some(format),
                content: Some(content),
            } => match RulesFormat::parse(&format) {
                Some(format) => AppMessageReply::from(self.update_rules(format, &content).await),
                None => AppMessageReply::failed(format!("unsupported rules format: {}", format)),
            },
            AppMessage::UpdateRules { .. } => AppMessageReply::failed("missing format/content"),
        };

        serde_json::to_vec(&reply).unwrap_or_else(|_| data.to_vec())
    }

    pub async fn sleep(&self) {}

    pub fn wake(&self) {}

    /// Platform bridge of the running session
    pub async fn platform(&self) -> Option<Arc<PlatformBridge>> {
        let state = self.state.lock().await;
        state.session.as_ref().map(|s| s.platform.clone())
    }

    /// Command server of the running session (none in bypass mode)
    pub async fn server(&self) -> Option<Arc<CommandServer>> {
        let state = self.state.lock().await;
        state.session.as_ref().and_then(|s| s.server.clone())
    }

    pub async fn layout(&self) -> Option<StorageLayout> {
        let state = self.state.lock().await;
        state.session.as_ref().map(|s| s.layout.clone())
    }

    fn set_phase(&self, state: &mut LifecycleState, phase: LifecyclePhase) {
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    async fn start_session(&self, options: &StartOptions) -> Result<Session> {
        let layout = StorageLayout::resolve_writable(&self.profile)
            .ok_or(TunnelError::StorageUnavailable)?;

        let socket_path = layout.command_socket();
        if !layout.command_socket_fits() {
            return Err(TunnelError::SocketPathTooLong {
                len: socket_path.as_os_str().len(),
                max: MAX_SOCKET_PATH_BYTES,
            });
        }

        let preferences = PreferencesStore::new(layout.preferences_file()).load_or_default();
        let engine = self.context.engine();
        let platform = Arc::new(PlatformBridge::new(
            self.host.clone(),
            engine.clone(),
            self.path_monitor.clone(),
            BlockingBridge::new(Handle::current()),
            preferences,
        ));

        if self.mode == TunnelMode::Bypass {
            platform.apply_settings(bypass_settings()).await?;
            return Ok(Session {
                layout,
                platform,
                server: None,
                config: None,
                watcher: None,
            });
        }

        self.context
            .ensure_setup(&SetupOptions::from_layout(&layout))
            .await?;

        if let Err(e) = engine.redirect_stderr(&layout.stderr_log()) {
            warn!("Failed to redirect engine stderr: {}", e);
        }

        let config = ConfigSource::new(&layout, options.config_payload.clone())
            .with_rules(options.routing_rules.clone());
        // A live socket of another instance fails here and is left alone
        let server = CommandServer::new(engine, platform.clone(), socket_path, config.clone());
        server.start().await?;

        let mut session = Session {
            layout,
            platform,
            server: Some(server.clone()),
            config: Some(config.clone()),
            watcher: None,
        };

        let starting = server.clone();
        let started = async move {
            let (content, _) = config.load()?;
            tokio::task::spawn_blocking(move || {
                starting.start_or_reload_service(&content, &OverrideOptions::default())
            })
            .await
            .map_err(|_| TunnelError::BridgeAborted)?
        }
        .await;

        if let Err(e) = started {
            Self::teardown(session).await;
            return Err(e);
        }

        session.watcher = Self::watch_shared_files(&session.layout, &server);
        Ok(session)
    }

    /// Reload when the host application rewrites rules or the override file
    fn watch_shared_files(
        layout: &StorageLayout,
        server: &Arc<CommandServer>,
    ) -> Option<FileReloadWatcher> {
        let override_file = layout.config_override();
        let override_name = override_file
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();

        let server = Arc::downgrade(server);
        let watched = FileReloadWatcher::start(
            &layout.shared_data_dir,
            &[RULES_JSON_FILE, RULES_TEXT_FILE, override_name],
            RELOAD_DEBOUNCE,
            move || {
                let Some(server) = server.upgrade() else { return };
                match server.service_reload() {
                    Ok(()) => info!("Reloaded after shared file change"),
                    Err(TunnelError::ServerClosed) => debug!("Skipping reload, server closed"),
                    Err(e) => warn!("Reload after shared file change failed: {}", e),
                }
            },
        );

        match watched {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Shared files are not watched: {}", e);
                None
            }
        }
    }

    async fn teardown(session: Session) {
        drop(session.watcher);
        if let Some(server) = session.server {
            // Closes the engine service too; the socket goes with the listener
            server.close().await;
        }
        session.platform.reset();
    }
}

impl From<Result<()>> for AppMessageReply {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

impl AppMessageReply {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Settings applied in [`TunnelMode::Bypass`]
pub fn bypass_settings() -> TunnelNetworkSettings {
    TunnelNetworkSettings {
        tunnel_remote_address: "10.0.0.1".to_string(),
        mtu: None,
        dns: Some(DnsSettings {
            servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
            match_domains: Vec::new(),
            match_domains_no_search: false,
        }),
        ipv4: Some(Ipv4Settings {
            addresses: vec![Ipv4Addr::new(10, 10, 10, 10)],
            subnet_masks: vec![Ipv4Addr::new(255, 255, 255, 0)],
            included_routes: Vec::new(),
            excluded_routes: Vec::new(),
        }),
        ipv6: None,
        proxy: None,
    }
}
