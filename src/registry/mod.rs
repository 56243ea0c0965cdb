//! Host and tunnel registry
//!
//! Built once from the configuration during a single-threaded validation
//! phase and read-only afterwards. Validation reports every problem in one
//! pass; a registry only exists when there were none.
//!
//! Order of work:
//! 1. each host and tunnel is validated on its own
//! 2. jump-host clients are rewritten behind synthetic tunnels
//! 3. hosts no tunnel uses are pruned

mod credentials;
pub mod jump;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{
    Address, ConfigError, Configuration, HostConfig, Scope, TunnelConfig, ValidationErrors,
};
use crate::forwarding::{StatsNotifier, Tunnel};
use crate::ssh::{Host, HostCredentials};

pub use credentials::CredentialCache;
pub use jump::JUMP_TUNNEL_SUFFIX;

/// A validated host
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub name: String,
    /// Dial address; a loopback entrance for jump-host clients
    pub address: Address,
    /// Address as configured
    pub configured_address: Address,
    pub credentials: HostCredentials,
    pub jump_host: Option<String>,
}

/// A validated tunnel
#[derive(Debug, Clone)]
pub struct TunnelEntry {
    pub name: String,
    pub local: Address,
    pub host: String,
    pub forward: Address,
    /// Fabricated by jump-host resolution
    pub synthetic: bool,
}

#[derive(Debug)]
pub struct Registry {
    hosts: BTreeMap<String, HostEntry>,
    tunnels: Vec<TunnelEntry>,
}

impl Registry {
    /// Validate a configuration
    pub fn validate(
        config: &Configuration,
        default_username: &str,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let mut credentials = CredentialCache::new();
        let mut declared = HashSet::new();
        let mut hosts = BTreeMap::new();

        for host in &config.hosts {
            let name = host.name.trim().to_string();
            let duplicate = !name.is_empty() && !declared.insert(name.clone());
            if duplicate {
                errors.push(ConfigError::DuplicateHost(name.clone()));
            }
            if let Some(entry) =
                validate_host(host, default_username, &mut credentials, &mut errors)
            {
                if !duplicate {
                    debug!("Host ({}) validated", entry.name);
                    hosts.insert(entry.name.clone(), entry);
                }
            }
        }

        let mut tunnel_names = HashSet::new();
        let mut tunnels = Vec::new();
        for tunnel in &config.tunnels {
            let name = tunnel.name.trim().to_string();
            let duplicate = !name.is_empty() && !tunnel_names.insert(name.clone());
            if duplicate {
                errors.push(ConfigError::DuplicateTunnel(name.clone()));
            }
            if let Some(entry) = validate_tunnel(tunnel, &declared, &mut errors) {
                if !duplicate {
                    debug!("Tunnel ({}) validated", entry.name);
                    tunnels.push(entry);
                }
            }
        }

        jump::resolve(&mut hosts, &mut tunnels, &declared, &mut errors);

        let used: HashSet<&str> = tunnels.iter().map(|t| t.host.as_str()).collect();
        let unused: Vec<String> = hosts
            .keys()
            .filter(|name| !used.contains(name.as_str()))
            .cloned()
            .collect();
        for name in unused {
            info!("Host ({}) is unused", name);
            hosts.remove(&name);
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        tunnels.sort_by_key(|t| !t.synthetic);

        Ok(Self { hosts, tunnels })
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostEntry> {
        self.hosts.values()
    }

    pub fn host(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.get(name)
    }

    pub fn tunnels(&self) -> &[TunnelEntry] {
        &self.tunnels
    }

    pub fn tunnel(&self, name: &str) -> Option<&TunnelEntry> {
        self.tunnels.iter().find(|t| t.name == name)
    }

    /// Create the runtime hosts and tunnels
    ///
    /// Every tunnel of a host shares that host's `Host`, and so its session.
    pub fn build_tunnels(&self, notifier: &StatsNotifier) -> TunnelSet {
        let hosts: HashMap<&str, Arc<Host>> = self
            .hosts
            .values()
            .map(|entry| {
                let host = Host::new(
                    entry.name.clone(),
                    entry.address.clone(),
                    entry.configured_address.clone(),
                    entry.credentials.clone(),
                );
                (entry.name.as_str(), Arc::new(host))
            })
            .collect();

        let mut set = TunnelSet::default();
        for entry in &self.tunnels {
            let Some(host) = hosts.get(entry.host.as_str()) else {
                continue;
            };
            let tunnel = Arc::new(Tunnel::new(
                entry.name.clone(),
                entry.local.clone(),
                host.clone(),
                entry.forward.clone(),
                notifier.clone(),
            ));
            if entry.synthetic {
                set.jump.push(tunnel);
            } else {
                set.direct.push(tunnel);
            }
        }
        set
    }
}

/// Runtime tunnels, split by whether they front a jump-host client
///
/// Jump tunnels must be listening before any direct tunnel can reach a
/// host through them.
#[derive(Debug, Default)]
pub struct TunnelSet {
    pub jump: Vec<Arc<Tunnel>>,
    pub direct: Vec<Arc<Tunnel>>,
}

impl TunnelSet {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tunnel>> {
        self.jump.iter().chain(self.direct.iter())
    }

    pub fn len(&self) -> usize {
        self.jump.len() + self.direct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn trimmed(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn validate_host(
    config: &HostConfig,
    default_username: &str,
    credentials: &mut CredentialCache,
    errors: &mut ValidationErrors,
) -> Option<HostEntry> {
    let before = errors.len();
    let name = config.name.trim().to_string();
    if name.is_empty() {
        errors.push(ConfigError::BlankHostName);
    }

    let username = match trimmed(config.username.as_ref()) {
        Some(username) => username.to_string(),
        None => {
            debug!("Host ({}) will use default username: {}", name, default_username);
            default_username.to_string()
        }
    };

    let known_hosts = match trimmed(config.known_hosts_path.as_ref()) {
        Some(path) => match credentials.known_hosts(path) {
            Ok(store) => Some(store),
            Err(reason) => {
                errors.push(ConfigError::KnownHosts {
                    host: name.clone(),
                    path: path.to_string(),
                    reason,
                });
                None
            }
        },
        None => None,
    };

    let passphrase = trimmed(config.passphrase.as_ref());
    let identity = match trimmed(config.identity_path.as_ref()) {
        Some(path) => match credentials.identity(path, passphrase) {
            Ok(key) => Some(key),
            Err(reason) => {
                errors.push(ConfigError::Identity {
                    host: name.clone(),
                    path: path.to_string(),
                    reason,
                });
                None
            }
        },
        None => {
            errors.push(ConfigError::MissingIdentity(name.clone()));
            None
        }
    };

    let jump_host = trimmed(config.jump_host.as_ref()).map(str::to_string);
    if jump_host.as_deref() == Some(name.as_str()) {
        errors.push(ConfigError::SelfJump(name.clone()));
    }

    // A jump-host client is dialed from the jump host, so its address only
    // has to resolve over there
    let scope = if jump_host.is_some() {
        Scope::Remote
    } else {
        Scope::Local
    };
    let address = match trimmed(config.address.as_ref()) {
        Some(raw) => match Address::parse(raw, scope) {
            Ok(address) => Some(address),
            Err(source) => {
                errors.push(ConfigError::Address {
                    owner: format!("host ({}) address", name),
                    source,
                });
                None
            }
        },
        None => {
            errors.push(ConfigError::MissingHostAddress(name.clone()));
            None
        }
    };

    if errors.len() != before {
        return None;
    }

    let (Some(address), Some(identity)) = (address, identity) else {
        return None;
    };
    Some(HostEntry {
        name,
        configured_address: address.clone(),
        address,
        credentials: HostCredentials {
            username,
            identity,
            known_hosts,
        },
        jump_host,
    })
}

fn validate_tunnel(
    config: &TunnelConfig,
    declared_hosts: &HashSet<String>,
    errors: &mut ValidationErrors,
) -> Option<TunnelEntry> {
    let before = errors.len();
    let name = config.name.trim().to_string();
    if name.is_empty() {
        errors.push(ConfigError::BlankTunnelName);
    }

    let forward = match trimmed(config.forward.as_ref()) {
        Some(raw) => match Address::parse(raw, Scope::Remote) {
            Ok(address) => Some(address),
            Err(source) => {
                errors.push(ConfigError::Address {
                    owner: format!("tunnel ({}) forward address", name),
                    source,
                });
                None
            }
        },
        None => {
            errors.push(ConfigError::MissingForward(name.clone()));
            None
        }
    };

    let local = match (trimmed(config.local.as_ref()), &forward) {
        (Some(raw), _) => match Address::parse(raw, Scope::Local) {
            Ok(address) => Some(address),
            Err(source) => {
                errors.push(ConfigError::Address {
                    owner: format!("tunnel ({}) local address", name),
                    source,
                });
                None
            }
        },
        (None, Some(forward)) => {
            let local = Address::unspecified(forward.port());
            warn!(
                "Tunnel ({}) local entrance undefined. Defaulting to {}",
                name, local
            );
            Some(local)
        }
        // Already reported as a forward address problem
        (None, None) => None,
    };

    let host = config.host.trim().to_string();
    if host.is_empty() {
        errors.push(ConfigError::MissingTunnelHost(name.clone()));
    } else if !declared_hosts.contains(&host) {
        errors.push(ConfigError::UndefinedHost {
            tunnel: name.clone(),
            host: host.clone(),
        });
    }

    if errors.len() != before {
        return None;
    }

    Some(TunnelEntry {
        name,
        local: local?,
        host,
        forward: forward?,
        synthetic: false,
    })
}
