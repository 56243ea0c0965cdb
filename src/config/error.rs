//! Configuration errors
//!
//! Loading errors stop at the first problem. Validation errors are
//! collected so a single run reports every problem in the file.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use super::address::AddressError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file ({0}) cannot be read: file not found")]
    NotFound(PathBuf),

    #[error("config file ({0}) cannot be read: file is a directory")]
    IsDirectory(PathBuf),

    #[error("config file ({0}) cannot be read: permission denied")]
    PermissionDenied(PathBuf),

    #[error("config file ({path}) cannot be read: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file ({0}) has unknown extension")]
    UnknownFormat(PathBuf),

    #[error("config file cannot be parsed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config file cannot be parsed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to determine home directory for the default config path")]
    NoHomeDir,

    #[error("host name cannot be blank")]
    BlankHostName,

    #[error("host name ({0}) redefined")]
    DuplicateHost(String),

    #[error("host ({0}) requires an address")]
    MissingHostAddress(String),

    #[error("host ({0}) missing identity file")]
    MissingIdentity(String),

    #[error("host ({host}) identity file ({path}) cannot be read: {reason}")]
    Identity {
        host: String,
        path: String,
        reason: String,
    },

    #[error("host ({host}) known_hosts file ({path}) cannot be read: {reason}")]
    KnownHosts {
        host: String,
        path: String,
        reason: String,
    },

    #[error("host ({0}) jump_host cannot reference itself")]
    SelfJump(String),

    #[error("host ({host}) jump_host ({jump_host}) is not defined")]
    UndefinedJumpHost { host: String, jump_host: String },

    #[error(
        "host ({host}) requires multi-host jumps ({jump_host} -> {next_hop}) and is not supported"
    )]
    MultiHopJump {
        host: String,
        jump_host: String,
        next_hop: String,
    },

    #[error("host ({host}) jump tunnel entrance cannot be allocated: {reason}")]
    NoFreePort { host: String, reason: String },

    #[error("tunnel name cannot be blank")]
    BlankTunnelName,

    #[error("tunnel name ({0}) redefined")]
    DuplicateTunnel(String),

    #[error("tunnel ({0}) requires a forward address")]
    MissingForward(String),

    #[error("tunnel ({0}) missing remote host")]
    MissingTunnelHost(String),

    #[error("tunnel ({tunnel}) remote host ({host}) undefined")]
    UndefinedHost { tunnel: String, host: String },

    #[error("{owner} {source}")]
    Address {
        owner: String,
        #[source]
        source: AddressError,
    },
}

/// Every problem found while validating a configuration
#[derive(Debug, Default)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl ValidationErrors {
    pub fn push(&mut self, error: ConfigError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}
