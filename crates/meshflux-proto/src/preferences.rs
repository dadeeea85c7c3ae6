//! Shared preferences
//!
//! Stored as JSON in the shared data directory so the host application can
//! write them and the tunnel process can read them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Preferences the tunnel process and the VPN profile depend on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedPreferences {
    /// Route all traffic through the tunnel ("global mode")
    pub include_all_networks: bool,
    /// Keep LAN traffic off the tunnel
    pub exclude_local_networks: bool,
    /// Keep push-notification traffic off the tunnel
    pub exclude_apns: bool,
    pub enforce_routes: bool,
    /// Reconnect automatically through on-demand rules
    pub always_on: bool,
}

impl Default for SharedPreferences {
    fn default() -> Self {
        Self {
            include_all_networks: false,
            exclude_local_networks: true,
            exclude_apns: true,
            enforce_routes: false,
            always_on: false,
        }
    }
}

/// Reads and writes [`SharedPreferences`] at a fixed path
#[derive(Debug, Clone)]
pub struct PreferencesStore {
    path: PathBuf,
}

impl PreferencesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load preferences, returning defaults when the file does not exist
    pub fn load(&self) -> Result<SharedPreferences> {
        if !self.path.exists() {
            return Ok(SharedPreferences::default());
        }

        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read preferences file: {:?}", self.path))?;

        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse preferences file: {:?}", self.path))
    }

    /// Load preferences, logging and falling back to defaults on any error
    pub fn load_or_default(&self) -> SharedPreferences {
        self.load().unwrap_or_else(|e| {
            warn!("Using default preferences: {:#}", e);
            SharedPreferences::default()
        })
    }

    /// Save preferences, creating the parent directory if needed
    pub fn save(&self, preferences: &SharedPreferences) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let json =
            serde_json::to_string_pretty(preferences).context("Failed to serialize preferences")?;

        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write preferences file: {:?}", self.path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let store = PreferencesStore::new(temp.path().join("preferences.json"));

        assert_eq!(store.load().unwrap(), SharedPreferences::default());
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let store = PreferencesStore::new(temp.path().join("MeshFlux").join("preferences.json"));

        let prefs = SharedPreferences {
            include_all_networks: true,
            always_on: true,
            ..Default::default()
        };
        store.save(&prefs).unwrap();

        assert_eq!(store.load().unwrap(), prefs);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("preferences.json");
        std::fs::write(&path, r#"{"include_all_networks":true}"#).unwrap();

        let prefs = PreferencesStore::new(&path).load().unwrap();
        assert!(prefs.include_all_networks);
        assert!(prefs.exclude_local_networks);
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("preferences.json");
        std::fs::write(&path, "not json").unwrap();

        let store = PreferencesStore::new(&path);
        assert!(store.load().is_err());
        assert_eq!(store.load_or_default(), SharedPreferences::default());
    }
}
