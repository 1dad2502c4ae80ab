//! Configuration management for nmlexport.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, FileSystemError, Result};
use crate::transfer::TransferOptions;

/// Directory under which removable volumes are mounted.
pub const DEFAULT_VOLUMES_ROOT: &str = "/Volumes";

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Directory holding mounted volumes; a job for volume `X` exports to `<volumes_root>/X`.
    #[serde(default = "default_volumes_root")]
    pub volumes_root: PathBuf,
    /// Whether exports delete audio files the catalogue no longer names.
    #[serde(default)]
    pub remove_orphans: bool,
    /// Catalogue to export when none is given on the command line.
    #[serde(default)]
    pub library_path: Option<PathBuf>,
    /// File copy settings.
    #[serde(default)]
    pub transfer: TransferOptions,
}

fn default_volumes_root() -> PathBuf {
    PathBuf::from(DEFAULT_VOLUMES_ROOT)
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            volumes_root: default_volumes_root(),
            remove_orphans: false,
            library_path: None,
            transfer: TransferOptions::default(),
        }
    }
}

impl ExportConfig {
    /// Load configuration from the default location, or defaults if there is none.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `path`, or defaults if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;
        config.transfer.validate()?;

        info!("Loaded config from {}", path.display());
        debug!("Volumes root: {}", config.volumes_root.display());
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Path of the default config file.
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("nmlexport")
        .join("config.json")
}
