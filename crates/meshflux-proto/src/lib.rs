//! Types shared by the MeshFlux host application, the packet-tunnel process
//! and the operator CLI.
//!
//! - [`paths`]: per-target platform profile and the on-disk storage layout
//! - [`preferences`]: user preferences persisted in the shared container
//! - [`ipc`]: the local command channel (newline-delimited JSON over a Unix socket)

#[cfg(unix)]
pub mod ipc;
pub mod paths;
pub mod preferences;

#[cfg(unix)]
pub use ipc::{
    IpcClient, IpcConnection, IpcRequest, IpcResponse, IpcServer, ServiceStatusInfo,
    SettingsSummary,
};
pub use paths::{DirectoryFlavor, PlatformProfile, StorageLayout, StorageSource};
pub use preferences::{PreferencesStore, SharedPreferences};
