//! Configuration file model
//!
//! Raw records as they appear in the YAML/JSON file. Nothing here is
//! validated; see `crate::registry` for the cross-checks.

use serde::{Deserialize, Serialize};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// A named SSH endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub name: String,

    /// `ip_or_host:port` of the SSH server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Login name; defaults to the current OS user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Path to the private key
    #[serde(default, alias = "identity", skip_serializing_if = "Option::is_none")]
    pub identity_path: Option<String>,

    /// Passphrase for an encrypted private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    /// known_hosts file used to verify the server key.
    /// When absent any server key is accepted.
    #[serde(default, alias = "known_hosts", skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<String>,

    /// Name of a host this one is only reachable through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_host: Option<String>,
}

/// A local entrance forwarded through a host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub name: String,

    /// `ip:port` to listen on; defaults to `0.0.0.0:<forward port>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,

    /// Name of the host that carries the traffic
    #[serde(default)]
    pub host: String,

    /// `ip_or_host:port` dialed from the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<String>,
}
