//! Engine configuration selection
//!
//! Order: payload supplied by the host application, then the override file
//! in the shared data directory, then [`default_config`]. Dynamic routing
//! rules are merged into whichever one wins.

use crate::engine::default_config;
use crate::error::{Result, TunnelError};
use crate::rules::{load_rules_file, RoutingRules, RulesFormat};
use meshflux_proto::StorageLayout;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Where a configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    Payload,
    OverrideFile,
    BuiltinDefault,
}

/// Clones share the injected routing rules
#[derive(Debug, Clone)]
pub struct ConfigSource {
    payload: Option<String>,
    override_path: PathBuf,
    snapshot_path: PathBuf,
    rules_dir: PathBuf,
    rules_override: Arc<Mutex<Option<String>>>,
}

impl ConfigSource {
    pub fn new(layout: &StorageLayout, payload: Option<String>) -> Self {
        Self {
            payload: payload.filter(|p| !p.trim().is_empty()),
            override_path: layout.config_override(),
            snapshot_path: layout.generated_config(),
            rules_dir: layout.shared_data_dir.clone(),
            rules_override: Arc::new(Mutex::new(None)),
        }
    }

    /// Use these routing rules instead of the rule files in the shared
    /// data directory
    pub fn with_rules(self, rules: Option<String>) -> Self {
        *self.rules_guard() = rules.filter(|r| !r.trim().is_empty());
        self
    }

    /// Forget injected rules so the rule files apply again
    pub fn clear_rules_override(&self) {
        if self.rules_guard().take().is_some() {
            info!("Dropped injected routing rules");
        }
    }

    /// Pick the configuration and write the snapshot (best effort).
    ///
    /// An unreadable override file is an error; a missing one is not.
    pub fn load(&self) -> Result<(String, ConfigOrigin)> {
        let (content, origin) = if let Some(payload) = &self.payload {
            (payload.clone(), ConfigOrigin::Payload)
        } else if self.override_path.exists() {
            let content = fs::read_to_string(&self.override_path).map_err(|e| {
                TunnelError::ConfigInvalid(format!(
                    "cannot read {}: {}",
                    self.override_path.display(),
                    e
                ))
            })?;
            (content, ConfigOrigin::OverrideFile)
        } else {
            let content = serde_json::to_string_pretty(&default_config())
                .map_err(|e| TunnelError::ConfigInvalid(e.to_string()))?;
            (content, ConfigOrigin::BuiltinDefault)
        };

        info!("Using {:?} configuration", origin);
        let content = self.apply_rules(content);

        if let Err(e) = fs::write(&self.snapshot_path, &content) {
            warn!(
                "Failed to write configuration snapshot {:?}: {}",
                self.snapshot_path, e
            );
        }

        Ok((content, origin))
    }

    /// Injected rules, else the rule files. Bad rules are logged and skipped.
    fn routing_rules(&self) -> Option<RoutingRules> {
        let injected = self.rules_guard().clone();
        let loaded = match injected {
            Some(content) => {
                let format = if content.trim_start().starts_with('{') {
                    RulesFormat::Json
                } else {
                    RulesFormat::Text
                };
                RoutingRules::parse(format, &content).map(Some)
            }
            None => load_rules_file(&self.rules_dir),
        };

        match loaded {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Ignoring routing rules: {}", e);
                None
            }
        }
    }

    fn apply_rules(&self, content: String) -> String {
        let Some(rules) = self.routing_rules() else {
            return content;
        };
        // An unparsable configuration is reported by the engine start
        let Ok(mut config) = serde_json::from_str::<serde_json::Value>(&content) else {
            return content;
        };
        if !rules.merge_into(&mut config) {
            return content;
        }

        match serde_json::to_string_pretty(&config) {
            Ok(merged) => {
                info!("Merged dynamic routing rules into the configuration");
                merged
            }
            Err(e) => {
                warn!("Failed to serialize merged configuration: {}", e);
                content
            }
        }
    }

    fn rules_guard(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.rules_override
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(temp: &TempDir) -> StorageLayout {
        let layout = StorageLayout::in_application_support(temp.path().join("OpenMesh"));
        layout.ensure_directories().unwrap();
        layout
    }

    #[test]
    fn test_payload_wins() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        fs::write(layout.config_override(), "{\"override\":true}").unwrap();

        let source = ConfigSource::new(&layout, Some("{\"payload\":true}".to_string()));
        let (content, origin) = source.load().unwrap();

        assert_eq!(origin, ConfigOrigin::Payload);
        assert_eq!(content, "{\"payload\":true}");
        assert_eq!(
            fs::read_to_string(layout.generated_config()).unwrap(),
            content
        );
    }

    #[test]
    fn test_override_file_then_default() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);

        let source = ConfigSource::new(&layout, Some("   ".to_string()));
        let (content, origin) = source.load().unwrap();
        assert_eq!(origin, ConfigOrigin::BuiltinDefault);
        assert!(content.contains("\"tun\""));

        fs::write(layout.config_override(), "{\"override\":true}").unwrap();
        let (_, origin) = source.load().unwrap();
        assert_eq!(origin, ConfigOrigin::OverrideFile);
    }

    const PROXY_CONFIG: &str = r#"{
        "outbounds": [{"type": "direct", "tag": "direct"}, {"type": "socks", "tag": "proxy"}],
        "route": {"final": "direct", "rules": [{"action": "sniff"}]}
    }"#;

    fn route_rules(content: &str) -> Vec<serde_json::Value> {
        let config: serde_json::Value = serde_json::from_str(content).unwrap();
        config["route"]["rules"].as_array().unwrap().clone()
    }

    #[test]
    fn test_rule_file_merged_into_config() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        fs::write(layout.config_override(), PROXY_CONFIG).unwrap();

        let source = ConfigSource::new(&layout, None);
        let (content, _) = source.load().unwrap();
        assert_eq!(route_rules(&content).len(), 1);

        fs::write(
            layout.shared_data_dir.join("routing_rules.txt"),
            "suffix:.example.com
",
        )
        .unwrap();
        let (content, origin) = source.load().unwrap();
        assert_eq!(origin, ConfigOrigin::OverrideFile);
        let rules = route_rules(&content);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1]["domain_suffix"][0], ".example.com");
        assert_eq!(rules[1]["outbound"], "proxy");
        assert_eq!(
            fs::read_to_string(layout.generated_config()).unwrap(),
            content
        );
    }

    #[test]
    fn test_injected_rules_win_until_cleared() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        fs::write(
            layout.shared_data_dir.join("routing_rules.json"),
            r#"{"domain":["file.example"]}"#,
        )
        .unwrap();

        let source = ConfigSource::new(&layout, Some(PROXY_CONFIG.to_string()))
            .with_rules(Some(r#"{"domain":["injected.example"]}"#.to_string()));
        let shared = source.clone();

        let (content, _) = source.load().unwrap();
        assert_eq!(route_rules(&content)[1]["domain"][0], "injected.example");

        shared.clear_rules_override();
        let (content, _) = source.load().unwrap();
        assert_eq!(route_rules(&content)[1]["domain"][0], "file.example");
    }

    #[test]
    fn test_bad_rules_are_skipped() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        fs::write(layout.shared_data_dir.join("routing_rules.json"), "[oops").unwrap();

        let source = ConfigSource::new(&layout, Some(PROXY_CONFIG.to_string()));
        let (content, origin) = source.load().unwrap();
        assert_eq!(origin, ConfigOrigin::Payload);
        assert_eq!(content, PROXY_CONFIG);
    }

    #[test]
    fn test_snapshot_failure_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        // Directories never created, so the snapshot write fails
        let layout = StorageLayout::in_application_support(temp.path().join("missing"));

        let source = ConfigSource::new(&layout, None);
        assert!(source.load().is_ok());
    }
}
