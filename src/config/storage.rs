//! Configuration Storage
//!
//! Reads the tunnel configuration from disk.
//! Config location: ~/.ferret/config.yaml unless overridden on the command line.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::types::Configuration;

/// Serialization format, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// Get the ferret configuration directory (~/.ferret)
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ferret"))
        .ok_or(ConfigError::NoHomeDir)
}

/// Default configuration file path
pub fn default_config_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.yaml"))
}

/// Expand ~ to home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

impl Configuration {
    /// Load a configuration file, picking the parser from its extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            ErrorKind::PermissionDenied => ConfigError::PermissionDenied(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        if metadata.is_dir() {
            return Err(ConfigError::IsDirectory(path.to_path_buf()));
        }

        let format = ConfigFormat::from_path(path)
            .ok_or_else(|| ConfigError::UnknownFormat(path.to_path_buf()))?;

        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => ConfigError::PermissionDenied(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        debug!("Loaded config file {} ({:?})", path.display(), format);
        Self::parse(&contents, format)
    }

    /// Parse configuration text in the given format
    pub fn parse(contents: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(contents)?,
            ConfigFormat::Json => serde_json::from_str(contents)?,
        };
        Ok(config)
    }
}
