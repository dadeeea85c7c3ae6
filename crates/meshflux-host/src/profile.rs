//! The OS VPN profile the host application installs for the tunnel provider

use meshflux_proto::{PlatformProfile, SharedPreferences};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Provider-configuration key holding a per-process nonce. A changed value
/// makes the OS persist the profile even when nothing else changed.
pub const CONFIG_NONCE_KEY: &str = "openmesh_config_nonce";
pub const APP_BUILD_KEY: &str = "openmesh_app_build";

/// Probe used by the captive-portal on-demand rule
pub const CAPTIVE_PROBE_URL: &str = "http://captive.apple.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceTypeMatch {
    Any,
    Wifi,
    Cellular,
    Ethernet,
}

/// An on-demand rule that connects the tunnel when it matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnDemandRule {
    pub interface_type_match: InterfaceTypeMatch,
    pub probe_url: Option<String>,
}

/// Connect on any interface, and when the captive-portal probe succeeds
pub fn default_on_demand_rules() -> Vec<OnDemandRule> {
    vec![
        OnDemandRule {
            interface_type_match: InterfaceTypeMatch::Any,
            probe_url: None,
        },
        OnDemandRule {
            interface_type_match: InterfaceTypeMatch::Any,
            probe_url: Some(CAPTIVE_PROBE_URL.to_string()),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtocolConfiguration {
    pub provider_bundle_identifier: String,
    pub server_address: String,
    pub provider_configuration: BTreeMap<String, String>,
    pub include_all_networks: bool,
    pub exclude_local_networks: bool,
    pub exclude_apns: bool,
    pub exclude_cellular_services: bool,
    pub enforce_routes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelProfile {
    pub id: Uuid,
    pub localized_description: String,
    pub enabled: bool,
    pub on_demand_enabled: bool,
    pub on_demand_rules: Vec<OnDemandRule>,
    pub protocol: ProtocolConfiguration,
}

impl TunnelProfile {
    /// A fresh, not yet saved profile for `platform`
    pub fn new(platform: &PlatformProfile) -> Self {
        Self {
            id: Uuid::new_v4(),
            localized_description: platform.application_name.clone(),
            enabled: true,
            on_demand_enabled: false,
            on_demand_rules: Vec::new(),
            protocol: ProtocolConfiguration {
                provider_bundle_identifier: platform.extension_bundle_identifier.clone(),
                server_address: platform.application_name.clone(),
                ..Default::default()
            },
        }
    }

    /// Whether the profile launches the given tunnel provider
    pub fn matches(&self, provider_bundle_identifier: &str) -> bool {
        self.protocol.provider_bundle_identifier == provider_bundle_identifier
    }

    /// Stamp identity and build information onto a loaded or new profile
    pub fn configure(&mut self, platform: &PlatformProfile, nonce: &str, app_build: &str) {
        self.localized_description = platform.application_name.clone();
        self.protocol.provider_bundle_identifier = platform.extension_bundle_identifier.clone();
        self.protocol.server_address = platform.application_name.clone();
        self.protocol
            .provider_configuration
            .insert(CONFIG_NONCE_KEY.to_string(), nonce.to_string());
        self.protocol
            .provider_configuration
            .insert(APP_BUILD_KEY.to_string(), app_build.to_string());
        self.enabled = true;
    }

    /// Copy routing flags and always-on from the shared preferences
    pub fn apply_preferences(&mut self, preferences: &SharedPreferences) {
        self.protocol.include_all_networks = preferences.include_all_networks;
        self.protocol.exclude_local_networks = preferences.exclude_local_networks;
        self.protocol.exclude_apns = preferences.exclude_apns;
        self.protocol.exclude_cellular_services = false;
        self.protocol.enforce_routes = preferences.enforce_routes;
        if preferences.always_on {
            self.set_always_on(true);
        }
    }

    pub fn set_always_on(&mut self, enabled: bool) {
        self.on_demand_enabled = enabled;
        self.on_demand_rules = default_on_demand_rules();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshflux_proto::DirectoryFlavor;

    fn platform() -> PlatformProfile {
        PlatformProfile {
            application_name: "MeshFlux".to_string(),
            extension_bundle_identifier: "com.meshnetprotocol.OpenMesh.mac.vpn-extension"
                .to_string(),
            app_group: "group.com.meshnetprotocol.OpenMesh".to_string(),
            flavor: DirectoryFlavor::Macos,
            shared_container: None,
            application_support: None,
        }
    }

    #[test]
    fn test_new_profile() {
        let profile = TunnelProfile::new(&platform());
        assert!(profile.matches("com.meshnetprotocol.OpenMesh.mac.vpn-extension"));
        assert!(!profile.matches("com.example.other"));
        assert_eq!(profile.localized_description, "MeshFlux");
        assert!(profile.enabled);
        assert!(!profile.on_demand_enabled);
    }

    #[test]
    fn test_configure_stamps_nonce_and_build() {
        let mut profile = TunnelProfile::new(&platform());
        profile.enabled = false;
        profile.configure(&platform(), "nonce-1", "42");

        let config = &profile.protocol.provider_configuration;
        assert_eq!(config.get(CONFIG_NONCE_KEY).map(String::as_str), Some("nonce-1"));
        assert_eq!(config.get(APP_BUILD_KEY).map(String::as_str), Some("42"));
        assert!(profile.enabled);
    }

    #[test]
    fn test_preferences_and_always_on() {
        let mut profile = TunnelProfile::new(&platform());
        profile.apply_preferences(&SharedPreferences {
            include_all_networks: true,
            always_on: true,
            ..Default::default()
        });

        assert!(profile.protocol.include_all_networks);
        assert!(profile.protocol.exclude_local_networks);
        assert!(profile.on_demand_enabled);
        assert_eq!(profile.on_demand_rules.len(), 2);
        assert_eq!(
            profile.on_demand_rules[1].probe_url.as_deref(),
            Some(CAPTIVE_PROBE_URL)
        );

        profile.set_always_on(false);
        assert!(!profile.on_demand_enabled);
    }
}
