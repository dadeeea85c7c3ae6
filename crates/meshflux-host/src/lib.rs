//! Host application side of MeshFlux
//!
//! Owns the OS VPN profile for the packet-tunnel provider and turns OS
//! connection status into the state the application renders.

pub mod error;
pub mod manager;
pub mod profile;
pub mod status;
pub mod subsystem;

pub use error::{HostError, SubsystemError};
pub use manager::{HostSettings, VpnConnectionManager};
pub use profile::{OnDemandRule, TunnelProfile};
pub use status::{ConnectionState, ConnectionStatus};
pub use subsystem::{InstalledProfile, SubsystemResult, VpnSubsystem};
