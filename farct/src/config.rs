//! Configuration module for the farct CLI.
//!
//! `farct.toml` carries an `[archive]` table that deserializes straight into
//! [`ArchiveConfig`]; anything left out keeps the library default.
//!
//! ```toml
//! verbose = false
//!
//! [archive]
//! requested_base_address = 34359738368
//! heap_archiving = false
//! ```

use dirs::{config_dir, home_dir};
use farc::ArchiveConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FarctError, Result};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "farct.toml";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Global verbose setting.
    #[serde(default)]
    pub verbose: bool,

    /// Archive build and load parameters.
    #[serde(default)]
    pub archive: ArchiveConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Searches the current directory, then `~/.config/farct`, then the
    /// system configuration directory. Falls back to defaults.
    pub fn load() -> Result<Self> {
        match Self::find_config_file() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FarctError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| FarctError::Config(format!("Failed to parse configuration: {}", e)))?;
        config
            .archive
            .validate()
            .map_err(|e| FarctError::Config(format!("[archive] table rejected: {}", e)))?;
        Ok(config)
    }

    fn check_current_dir_config() -> Option<PathBuf> {
        let path = PathBuf::from(CONFIG_FILE_NAME);
        path.exists().then_some(path)
    }

    fn check_home_config() -> Option<PathBuf> {
        home_dir()
            .map(|dir| dir.join(".config").join("farct").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    fn check_system_config() -> Option<PathBuf> {
        config_dir()
            .map(|dir| dir.join("farct").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    fn find_config_file() -> Option<PathBuf> {
        Self::check_current_dir_config()
            .or_else(Self::check_home_config)
            .or_else(Self::check_system_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.verbose);
        assert!(config.archive.heap_archiving);
        assert_eq!(config.archive.requested_base_address, 0x8_0000_0000);
    }

    #[test]
    fn test_partial_archive_table_keeps_defaults() {
        let config = Config::parse(
            "verbose = true\n[archive]\nheap_archiving = false\nobject_alignment = 16\n",
        )
        .unwrap();
        assert!(config.verbose);
        assert!(!config.archive.heap_archiving);
        assert_eq!(config.archive.object_alignment, 16);
        assert_eq!(config.archive.requested_base_address, 0x8_0000_0000);
    }

    #[test]
    fn test_invalid_archive_table_is_rejected() {
        let err = Config::parse("[archive]\ncore_region_alignment = 100\n").unwrap_err();
        assert!(matches!(err, FarctError::Config(_)));
    }

    #[test]
    fn test_load_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[archive]\nverify_regions = false\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert!(!config.archive.verify_regions);
    }

    #[test]
    fn test_load_from_nonexistent_path() {
        let result = Config::load_from_path(Path::new("/nonexistent/path/farct.toml"));
        assert!(matches!(result, Err(FarctError::Config(_))));
    }
}
