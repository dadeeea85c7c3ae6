//! Packet-tunnel side of MeshFlux
//!
//! Runs inside the OS tunnel-provider process: prepares storage, starts the
//! embedded routing engine behind a local command server, and answers the
//! engine's platform callbacks (open the tunnel, monitor the default
//! interface, toggle the system proxy) against the OS tunnel host. Dynamic
//! routing rules from the shared data directory are merged into the engine
//! configuration and reloaded when they change.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod monitor;
pub mod platform;
#[cfg(unix)]
pub mod provider;
pub mod rules;
#[cfg(unix)]
pub mod server;
pub mod settings;
#[cfg(unix)]
pub mod watcher;

pub use bridge::{BlockingBridge, PendingOperation};
pub use config::{ConfigOrigin, ConfigSource};
pub use engine::{
    Engine, EngineContext, EngineService, OverrideOptions, PlatformInterface, SetupOptions,
    SystemProxyStatus,
};
pub use error::{Result, TunnelError};
pub use host::TunnelHost;
pub use monitor::{
    InterfaceMonitor, InterfaceUpdateEvent, InterfaceUpdateListener, NetworkInterface,
    NetworkPath, PathMonitor, PathSubscription,
};
pub use platform::PlatformBridge;
pub use rules::{RoutingRules, RulesFormat};
#[cfg(unix)]
pub use provider::{
    LifecyclePhase, ProviderDependencies, StartOptions, StopReason, TunnelLifecycleController,
    TunnelMode,
};
#[cfg(unix)]
pub use server::CommandServer;
pub use settings::{translate, TunOptions, TunnelNetworkSettings};
#[cfg(unix)]
pub use watcher::FileReloadWatcher;
