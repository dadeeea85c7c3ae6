//! Host-side VPN connection manager
//!
//! Loads (or creates) the OS VPN profile once, starts and stops the tunnel
//! through the OS, and republishes OS status changes as [`ConnectionState`].
//! Failures go to a single alert channel handed out by
//! [`VpnConnectionManager::new`].

use crate::error::HostError;
use crate::profile::TunnelProfile;
use crate::status::{ConnectionState, ConnectionStatus};
use crate::subsystem::VpnSubsystem;
use meshflux_proto::{PlatformProfile, PreferencesStore};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Static configuration of the host application
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub platform: PlatformProfile,
    pub preferences: PreferencesStore,
    /// Application build number, stamped into the profile
    pub app_build: String,
}

#[derive(Debug, Deserialize)]
struct ProviderReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

struct Inner {
    subsystem: Arc<dyn VpnSubsystem>,
    platform: PlatformProfile,
    preferences: PreferencesStore,
    app_build: String,
    /// Fresh per process
    nonce: String,
    profile: OnceCell<Mutex<TunnelProfile>>,
    state_tx: watch::Sender<ConnectionState>,
    connect_in_flight: AtomicBool,
    attempted_start: AtomicBool,
    alerts: mpsc::UnboundedSender<HostError>,
    observer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

pub struct VpnConnectionManager {
    inner: Arc<Inner>,
}

impl VpnConnectionManager {
    /// Create the manager and the receiving end of its alert channel
    pub fn new(
        subsystem: Arc<dyn VpnSubsystem>,
        settings: HostSettings,
    ) -> (Self, mpsc::UnboundedReceiver<HostError>) {
        let (alerts, alerts_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::default());

        let inner = Arc::new(Inner {
            subsystem,
            platform: settings.platform,
            preferences: settings.preferences,
            app_build: settings.app_build,
            nonce: Uuid::new_v4().to_string(),
            profile: OnceCell::new(),
            state_tx,
            connect_in_flight: AtomicBool::new(false),
            attempted_start: AtomicBool::new(false),
            alerts,
            observer: std::sync::Mutex::new(None),
        });

        (Self { inner }, alerts_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Load or create the profile and start following its status
    pub async fn load(&self) -> Result<(), HostError> {
        self.inner.profile().await.map(|_| ())
    }

    /// Copy of the cached profile, if it was loaded
    pub async fn profile(&self) -> Option<TunnelProfile> {
        match self.inner.profile.get() {
            Some(cell) => Some(cell.lock().await.clone()),
            None => None,
        }
    }

    /// Start the tunnel. No-op while connecting or connected.
    pub async fn connect(&self) {
        self.inner.connect().await;
    }

    /// Ask the OS to stop the tunnel. Completion shows up as status changes.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub async fn toggle(&self) {
        if self.state().is_connected {
            self.disconnect().await;
        } else {
            self.connect().await;
        }
    }

    /// Best-effort disconnect when the application exits; not awaited
    pub fn on_terminate(&self) -> Option<JoinHandle<()>> {
        let Ok(handle) = Handle::try_current() else {
            warn!("No runtime available, skipping disconnect on exit");
            return None;
        };
        let inner = self.inner.clone();
        Some(handle.spawn(async move { inner.disconnect().await }))
    }

    /// Toggle on-demand connection and persist the choice
    pub async fn set_always_on(&self, enabled: bool) -> Result<(), HostError> {
        let cell = self.inner.profile().await?;

        let mut preferences = self.inner.preferences.load_or_default();
        preferences.always_on = enabled;
        if let Err(e) = self.inner.preferences.save(&preferences) {
            warn!("Failed to save preferences: {:#}", e);
        }

        let mut profile = cell.lock().await;
        profile.set_always_on(enabled);
        self.inner
            .subsystem
            .save_profile(&profile)
            .await
            .map_err(HostError::ProfileSaveFailed)?;
        info!("Always-on {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Wait until the connection is down. Returns `false` on timeout.
    pub async fn wait_until_disconnected(&self, timeout: Duration) -> bool {
        let mut state_rx = self.subscribe();
        let down = state_rx.wait_for(|s| s.status.is_down());
        let done = matches!(tokio::time::timeout(timeout, down).await, Ok(Ok(_)));
        done
    }

    /// Ask the running tunnel to rebuild its configuration
    pub async fn request_reload(&self) -> Result<(), HostError> {
        let cell = self.inner.profile.get().ok_or_else(|| {
            HostError::ProviderMessageFailed("VPN profile not loaded".to_string())
        })?;
        let id = cell.lock().await.id;

        let reply = self
            .inner
            .subsystem
            .send_provider_message(id, br#"{"action":"reload"}"#.to_vec())
            .await
            .map_err(|e| HostError::ProviderMessageFailed(e.to_string()))?;

        let reply: ProviderReply = serde_json::from_slice(&reply)
            .map_err(|e| HostError::ProviderMessageFailed(format!("invalid reply: {}", e)))?;
        if reply.ok {
            Ok(())
        } else {
            Err(HostError::ProviderMessageFailed(
                reply.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    /// Stop following status changes
    pub fn shutdown(&self) {
        self.inner.stop_observer();
    }
}

impl Drop for VpnConnectionManager {
    fn drop(&mut self) {
        self.inner.stop_observer();
    }
}

impl Inner {
    async fn profile(self: &Arc<Self>) -> Result<&Mutex<TunnelProfile>, HostError> {
        let cell = self
            .profile
            .get_or_try_init(|| self.load_or_create())
            .await?;
        let id = cell.lock().await.id;
        self.ensure_observer(id);
        Ok(cell)
    }

    async fn load_or_create(&self) -> Result<Mutex<TunnelProfile>, HostError> {
        let installed = self
            .subsystem
            .load_profiles()
            .await
            .map_err(HostError::ProfileLoadFailed)?;

        let bundle = &self.platform.extension_bundle_identifier;
        let mut candidates: Vec<_> = installed
            .into_iter()
            .filter(|p| p.profile.matches(bundle))
            .collect();

        // Prefer the one the OS is running when duplicates exist
        let mut profile = if candidates.is_empty() {
            info!("No VPN profile for {}, creating one", bundle);
            TunnelProfile::new(&self.platform)
        } else {
            let index = candidates
                .iter()
                .position(|p| p.status.is_active())
                .unwrap_or(0);
            candidates.swap_remove(index).profile
        };

        profile.configure(&self.platform, &self.nonce, &self.app_build);
        Ok(Mutex::new(profile))
    }

    fn ensure_observer(self: &Arc<Self>, id: Uuid) {
        let mut observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if observer.is_some() {
            return;
        }

        // Subscribe before reading the current status so nothing is missed
        let mut status_rx = self.subsystem.subscribe_status(id);
        self.publish(self.subsystem.status(id));

        let weak: Weak<Self> = Arc::downgrade(self);
        *observer = Some(tokio::spawn(async move {
            loop {
                let status = match status_rx.recv().await {
                    Ok(status) => Some(status),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} VPN status notifications", skipped);
                        None
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(inner) = weak.upgrade() else { break };
                let status = status.unwrap_or_else(|| inner.subsystem.status(id));
                inner.on_status(id, status).await;
            }
            debug!("VPN status observer finished");
        }));
    }

    fn stop_observer(&self) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(observer) = observer {
            observer.abort();
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        let next = ConnectionState::from_status(status);
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    async fn on_status(&self, id: Uuid, status: ConnectionStatus) {
        debug!("VPN status: {:?}", status);
        self.publish(status);

        if status != ConnectionStatus::Disconnected {
            return;
        }
        if self.attempted_start.swap(false, Ordering::SeqCst) {
            if let Some(reason) = self.subsystem.last_disconnect_error(id).await {
                warn!("VPN disconnected after start: {}", reason);
                let _ = self.alerts.send(HostError::Disconnected(reason));
            }
        }
    }

    async fn connect(self: &Arc<Self>) {
        if self.busy() {
            return;
        }
        if self
            .connect_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Connect ignored, another connect is in flight");
            return;
        }

        let result = self.start_tunnel().await;
        self.connect_in_flight.store(false, Ordering::SeqCst);

        if let Err(e) = result {
            self.attempted_start.store(false, Ordering::SeqCst);
            self.state_tx.send_if_modified(|state| {
                let reset = state.status.is_connecting();
                let changed = state.is_connecting != reset;
                state.is_connecting = reset;
                changed
            });
            error!("{}", e);
            let _ = self.alerts.send(e);
        }
    }

    fn busy(&self) -> bool {
        let current = *self.state_tx.borrow();
        if current.is_connecting || current.is_connected {
            debug!("Connect ignored, VPN is {:?}", current.status);
            return true;
        }
        false
    }

    async fn start_tunnel(self: &Arc<Self>) -> Result<(), HostError> {
        // Loading publishes the OS status, which may already be up
        let cell = self.profile().await?;
        if self.busy() {
            return Ok(());
        }

        self.state_tx.send_if_modified(|state| {
            let changed = !state.is_connecting;
            state.is_connecting = true;
            changed
        });
        self.attempted_start.store(true, Ordering::SeqCst);

        let preferences = self.preferences.load_or_default();
        let mut profile = cell.lock().await;
        profile.enabled = true;
        profile.apply_preferences(&preferences);
        self.subsystem
            .save_profile(&profile)
            .await
            .map_err(HostError::ProfileSaveFailed)?;
        let id = profile.id;
        drop(profile);

        self.subsystem
            .start_tunnel(id)
            .await
            .map_err(HostError::TunnelStartFailed)?;
        info!("VPN start requested");
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(cell) = self.profile.get() else {
            debug!("Disconnect ignored, no VPN profile loaded");
            return;
        };

        let mut profile = cell.lock().await;
        if profile.on_demand_enabled {
            // Otherwise the OS reconnects right away
            profile.on_demand_enabled = false;
            if let Err(e) = self.subsystem.save_profile(&profile).await {
                let _ = self.alerts.send(HostError::ProfileSaveFailed(e));
            }
        }
        let id = profile.id;
        drop(profile);

        if let Err(e) = self.subsystem.stop_tunnel(id).await {
            error!("Failed to stop VPN: {}", e);
            let _ = self.alerts.send(HostError::TunnelStopFailed(e));
        } else {
            info!("VPN stop requested");
        }
    }
}
