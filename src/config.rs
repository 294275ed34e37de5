//! Configuration management for v3d-qpu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`V3D_DEVICE`, etc.)
//! 2. Project-local config file (`./v3d-qpu.toml`)
//! 3. User config file (`~/.config/v3d-qpu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # v3d-qpu.toml
//!
//! # DRM node to open instead of probing /dev/dri/card*
//! device = "/dev/dri/card1"
//!
//! # Size of the GPU memory arena in bytes (default 32 MiB)
//! data_area_size = 67108864
//!
//! # Completion wait timeout in seconds (default 10)
//! exec_timeout_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Default arena size: room for code, uniforms and a few dozen MiB of
/// data buffers.
const DEFAULT_DATA_AREA_SIZE: usize = 32 * 1024 * 1024;

/// Default completion wait before declaring the device unresponsive.
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 10;

/// v3d-qpu configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// DRM node to open. When unset, `/dev/dri/card*` is probed for the
    /// node driven by `v3d`.
    pub device: Option<String>,

    /// GPU memory arena size in bytes.
    pub data_area_size: Option<usize>,

    /// Completion wait timeout in seconds.
    pub exec_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `v3d-qpu.toml`
    /// 3. User config `~/.config/v3d-qpu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Explicit device path, if one was configured.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Arena size, with fallback to the default.
    pub fn data_area_size(&self) -> usize {
        self.data_area_size.unwrap_or(DEFAULT_DATA_AREA_SIZE)
    }

    /// Completion timeout, with fallback to the default.
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS))
    }

    /// Load user configuration from ~/.config/v3d-qpu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("v3d-qpu").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./v3d-qpu.toml
    fn load_local_config() -> Option<Self> {
        // Try current directory
        let local_path = Path::new("v3d-qpu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        // Try to find project root by looking for Cargo.toml
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("v3d-qpu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.device.is_some() {
            self.device = other.device;
        }
        if other.data_area_size.is_some() {
            self.data_area_size = other.data_area_size;
        }
        if other.exec_timeout_secs.is_some() {
            self.exec_timeout_secs = other.exec_timeout_secs;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("V3D_DEVICE") {
            log::info!("Using V3D_DEVICE from environment: {}", path);
            self.device = Some(path);
        }
        if let Ok(size) = std::env::var("V3D_DATA_AREA_SIZE") {
            match size.parse() {
                Ok(size) => self.data_area_size = Some(size),
                Err(_) => log::warn!("Ignoring unparseable V3D_DATA_AREA_SIZE: {}", size),
            }
        }
        if let Ok(secs) = std::env::var("V3D_EXEC_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => self.exec_timeout_secs = Some(secs),
                Err(_) => log::warn!("Ignoring unparseable V3D_EXEC_TIMEOUT_SECS: {}", secs),
            }
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("v3d-qpu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# v3d-qpu configuration
# Place this file at ~/.config/v3d-qpu/config.toml or ./v3d-qpu.toml

# DRM node to open instead of probing (optional)
# device = "/dev/dri/card1"

# GPU memory arena size in bytes (optional, default 32 MiB)
# data_area_size = 67108864

# Completion wait timeout in seconds (optional, default 10)
# exec_timeout_secs = 30
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.device(), None);
        assert_eq!(config.data_area_size(), DEFAULT_DATA_AREA_SIZE);
        assert_eq!(config.exec_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            device: Some("/dev/dri/card0".to_string()),
            data_area_size: None,
            exec_timeout_secs: Some(5),
        };

        let overlay = Config {
            device: None,
            data_area_size: Some(1 << 20),
            exec_timeout_secs: Some(20),
        };

        base.merge(overlay);

        // device unchanged (overlay was None)
        assert_eq!(base.device.as_deref(), Some("/dev/dri/card0"));
        // data_area_size set from overlay
        assert_eq!(base.data_area_size, Some(1 << 20));
        // exec_timeout_secs overridden by overlay
        assert_eq!(base.exec_timeout_secs, Some(20));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        // Should parse without error
        let _: Config = toml::from_str(&sample).expect("Sample config should parse");
    }
}
