//! Storage layout shared by the host application and the tunnel process
//!
//! The layout is rooted in the app-group shared container when the platform
//! exposes one, otherwise in a private application-support directory.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Package name the app-group identifier and bundle identifiers derive from
pub const PACKAGE_NAME: &str = "com.meshnetprotocol.OpenMesh";

/// Directory inside the base directory holding app-written shared data
pub const SHARED_DATA_DIR: &str = "MeshFlux";

/// `sockaddr_un.sun_path` holds 104 bytes including the trailing NUL
pub const MAX_SOCKET_PATH_BYTES: usize = 103;

/// How directories are laid out under the shared container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryFlavor {
    /// Caches live under `Library/Caches` of the container
    Ios,
    /// Same as iOS
    Macos,
    /// The container root is already `Library/Caches`
    Tvos,
}

/// Where the resolved layout is rooted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageSource {
    SharedContainer,
    ApplicationSupport,
}

/// Per-target configuration, resolved once at start-up and passed by value
#[derive(Debug, Clone)]
pub struct PlatformProfile {
    /// Display name, also used as the localized VPN profile description
    pub application_name: String,
    /// Bundle identifier of the packet-tunnel provider
    pub extension_bundle_identifier: String,
    /// App-group identifier (`group.<package>`)
    pub app_group: String,
    pub flavor: DirectoryFlavor,
    /// App-group container, if the platform grants one
    pub shared_container: Option<PathBuf>,
    /// Private application-support root used as fallback
    pub application_support: Option<PathBuf>,
}

impl PlatformProfile {
    /// Profile for the target this binary was built for
    pub fn current() -> Self {
        let app_group = format!("group.{}", PACKAGE_NAME);

        #[cfg(target_os = "macos")]
        let (application_name, extension_bundle_identifier, flavor) = (
            "MeshFlux",
            format!("{}.mac.vpn-extension", PACKAGE_NAME),
            DirectoryFlavor::Macos,
        );
        #[cfg(target_os = "tvos")]
        let (application_name, extension_bundle_identifier, flavor) = (
            "OpenMesh TV",
            format!("{}.vpn-extension", PACKAGE_NAME),
            DirectoryFlavor::Tvos,
        );
        #[cfg(not(any(target_os = "macos", target_os = "tvos")))]
        let (application_name, extension_bundle_identifier, flavor) = (
            "OpenMesh",
            format!("{}.vpn-extension", PACKAGE_NAME),
            DirectoryFlavor::Ios,
        );

        let shared_container = Self::detect_shared_container(&app_group);

        Self {
            application_name: application_name.to_string(),
            extension_bundle_identifier,
            app_group,
            flavor,
            shared_container,
            application_support: dirs::data_dir(),
        }
    }

    /// `MESHFLUX_SHARED_DIR` wins; otherwise the group container under the home directory
    fn detect_shared_container(app_group: &str) -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("MESHFLUX_SHARED_DIR") {
            return Some(PathBuf::from(dir));
        }

        let candidate = dirs::home_dir()?
            .join("Library")
            .join("Group Containers")
            .join(app_group);
        candidate.is_dir().then_some(candidate)
    }
}

/// Resolved directories for one tunnel process or host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub source: StorageSource,
    pub base_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub working_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub shared_data_dir: PathBuf,
}

impl StorageLayout {
    /// Resolve the layout for a platform profile.
    ///
    /// Returns `None` only when neither the shared container nor the
    /// application-support directory is available.
    pub fn resolve(profile: &PlatformProfile) -> Option<Self> {
        if let Some(container) = &profile.shared_container {
            info!("Using shared container at {:?}", container);
            return Some(Self::in_shared_container(container, profile.flavor));
        }

        let layout = Self::application_support_layout(profile)?;
        warn!(
            "Shared container {} unavailable, falling back to application support at {:?}",
            profile.app_group, layout.base_dir
        );
        Some(layout)
    }

    /// Resolve the layout and create its directories.
    ///
    /// A shared container whose directories cannot be created is skipped in
    /// favor of application support. Returns `None` when neither location
    /// is usable.
    pub fn resolve_writable(profile: &PlatformProfile) -> Option<Self> {
        if let Some(container) = &profile.shared_container {
            let layout = Self::in_shared_container(container, profile.flavor);
            match layout.ensure_directories() {
                Ok(()) => {
                    info!("Using shared container at {:?}", container);
                    return Some(layout);
                }
                Err(e) => warn!("Shared container {:?} is not writable: {}", container, e),
            }
        }

        let layout = Self::application_support_layout(profile)?;
        match layout.ensure_directories() {
            Ok(()) => {
                warn!(
                    "Falling back to application support at {:?}",
                    layout.base_dir
                );
                Some(layout)
            }
            Err(e) => {
                warn!(
                    "Application support {:?} is not writable: {}",
                    layout.base_dir, e
                );
                None
            }
        }
    }

    fn application_support_layout(profile: &PlatformProfile) -> Option<Self> {
        let support = profile.application_support.as_ref()?;
        Some(Self::in_application_support(
            support.join(&profile.application_name),
        ))
    }

    /// Layout rooted in the app-group container
    pub fn in_shared_container(container: &Path, flavor: DirectoryFlavor) -> Self {
        let base_dir = container.to_path_buf();
        let cache_dir = match flavor {
            DirectoryFlavor::Ios | DirectoryFlavor::Macos => {
                base_dir.join("Library").join("Caches")
            }
            DirectoryFlavor::Tvos => base_dir.clone(),
        };

        Self {
            source: StorageSource::SharedContainer,
            working_dir: cache_dir.join("Working"),
            temp_dir: cache_dir.clone(),
            shared_data_dir: base_dir.join(SHARED_DATA_DIR),
            cache_dir,
            base_dir,
        }
    }

    /// Layout rooted in a private application-support directory
    pub fn in_application_support(base_dir: PathBuf) -> Self {
        Self {
            source: StorageSource::ApplicationSupport,
            cache_dir: base_dir.clone(),
            working_dir: base_dir.join("work"),
            temp_dir: base_dir.join("tmp"),
            shared_data_dir: base_dir.join(SHARED_DATA_DIR),
            base_dir,
        }
    }

    /// Create every directory of the layout, parents included.
    ///
    /// Pre-existing directories are fine.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.base_dir,
            &self.cache_dir,
            &self.working_dir,
            &self.temp_dir,
            &self.shared_data_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Engine command socket
    pub fn command_socket(&self) -> PathBuf {
        self.base_dir.join("command.sock")
    }

    /// Whether the command socket path fits in `sun_path`
    pub fn command_socket_fits(&self) -> bool {
        self.command_socket().as_os_str().len() <= MAX_SOCKET_PATH_BYTES
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.cache_dir.join("stderr.log")
    }

    /// Snapshot of the last configuration handed to the engine
    pub fn generated_config(&self) -> PathBuf {
        self.cache_dir.join("generated_config.json")
    }

    /// Engine configuration override written by the host application
    pub fn config_override(&self) -> PathBuf {
        self.shared_data_dir.join("singbox_config.json")
    }

    pub fn preferences_file(&self) -> PathBuf {
        self.shared_data_dir.join("preferences.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn profile(shared: Option<PathBuf>, support: Option<PathBuf>) -> PlatformProfile {
        PlatformProfile {
            application_name: "OpenMesh".to_string(),
            extension_bundle_identifier: format!("{}.vpn-extension", PACKAGE_NAME),
            app_group: format!("group.{}", PACKAGE_NAME),
            flavor: DirectoryFlavor::Ios,
            shared_container: shared,
            application_support: support,
        }
    }

    #[test]
    fn test_shared_container_preferred() {
        let layout = StorageLayout::resolve(&profile(
            Some(PathBuf::from("/group")),
            Some(PathBuf::from("/support")),
        ))
        .unwrap();

        assert_eq!(layout.source, StorageSource::SharedContainer);
        assert_eq!(layout.base_dir, PathBuf::from("/group"));
        assert_eq!(layout.cache_dir, PathBuf::from("/group/Library/Caches"));
        assert_eq!(
            layout.working_dir,
            PathBuf::from("/group/Library/Caches/Working")
        );
        assert_eq!(layout.temp_dir, layout.cache_dir);
        assert_eq!(layout.command_socket(), PathBuf::from("/group/command.sock"));
    }

    #[test]
    fn test_application_support_fallback() {
        let layout =
            StorageLayout::resolve(&profile(None, Some(PathBuf::from("/support")))).unwrap();

        assert_eq!(layout.source, StorageSource::ApplicationSupport);
        assert_eq!(layout.base_dir, PathBuf::from("/support/OpenMesh"));
        assert_eq!(layout.working_dir, PathBuf::from("/support/OpenMesh/work"));
        assert_eq!(layout.temp_dir, PathBuf::from("/support/OpenMesh/tmp"));
    }

    #[test]
    fn test_no_storage_available() {
        assert!(StorageLayout::resolve(&profile(None, None)).is_none());
    }

    #[test]
    fn test_unwritable_container_falls_back() {
        let temp = TempDir::new().unwrap();
        // A regular file where the container directory should be
        let blocked = temp.path().join("group");
        std::fs::write(&blocked, b"").unwrap();
        let support = temp.path().join("support");

        let layout =
            StorageLayout::resolve_writable(&profile(Some(blocked.clone()), Some(support)))
                .unwrap();
        assert_eq!(layout.source, StorageSource::ApplicationSupport);
        assert!(layout.working_dir.is_dir());
        assert!(layout.shared_data_dir.is_dir());

        let writable = temp.path().join("writable");
        let layout =
            StorageLayout::resolve_writable(&profile(Some(writable.clone()), None)).unwrap();
        assert_eq!(layout.source, StorageSource::SharedContainer);
        assert_eq!(layout.base_dir, writable);
        assert!(layout.cache_dir.is_dir());
    }

    #[test]
    fn test_nothing_writable() {
        let temp = TempDir::new().unwrap();
        let blocked = temp.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();

        assert!(StorageLayout::resolve_writable(&profile(
            Some(blocked.clone()),
            Some(blocked.clone())
        ))
        .is_none());
        assert!(StorageLayout::resolve_writable(&profile(Some(blocked), None)).is_none());
    }

    #[test]
    fn test_tvos_container_is_cache() {
        let layout = StorageLayout::in_shared_container(Path::new("/tv"), DirectoryFlavor::Tvos);
        assert_eq!(layout.cache_dir, PathBuf::from("/tv"));
        assert_eq!(layout.working_dir, PathBuf::from("/tv/Working"));
    }

    #[test]
    fn test_ensure_directories_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let layout =
            StorageLayout::in_shared_container(&temp.path().join("group"), DirectoryFlavor::Macos);

        layout.ensure_directories().unwrap();
        layout.ensure_directories().unwrap();

        assert!(layout.working_dir.is_dir());
        assert!(layout.shared_data_dir.is_dir());
    }

    #[test]
    fn test_command_socket_length_limit() {
        let short = StorageLayout::in_application_support(PathBuf::from("/tmp/mf"));
        assert!(short.command_socket_fits());

        let long = StorageLayout::in_application_support(PathBuf::from(format!(
            "/tmp/{}",
            "x".repeat(120)
        )));
        assert!(!long.command_socket_fits());
    }
}
