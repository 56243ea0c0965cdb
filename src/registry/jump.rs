//! Jump-host resolution
//!
//! A host reachable only through a jump host is rewritten into a direct
//! host fronted by a synthetic tunnel: the tunnel listens on an ephemeral
//! loopback port, is carried by the jump host, and forwards to the host's
//! configured address. The host's dial address then becomes that loopback
//! entrance, so its own SSH session runs inside the jump host's session.
//!
//! Only a single hop is supported.

use std::collections::{BTreeMap, HashSet};
use std::net::TcpListener;

use tracing::info;

use super::{HostEntry, TunnelEntry};
use crate::config::{Address, ConfigError, ValidationErrors};

/// Suffix of synthetic tunnel names
pub const JUMP_TUNNEL_SUFFIX: &str = "jumphost";

/// Rewrite every jump-host client that a tunnel uses
///
/// `declared` holds every host name from the configuration, including ones
/// that failed validation, so those are not reported a second time.
pub fn resolve(
    hosts: &mut BTreeMap<String, HostEntry>,
    tunnels: &mut Vec<TunnelEntry>,
    declared: &HashSet<String>,
    errors: &mut ValidationErrors,
) {
    let targets: HashSet<String> = tunnels.iter().map(|t| t.host.clone()).collect();
    let clients: Vec<(String, String)> = hosts
        .values()
        .filter(|h| targets.contains(&h.name))
        .filter_map(|h| h.jump_host.clone().map(|jump| (h.name.clone(), jump)))
        .filter(|(name, jump)| name != jump)
        .collect();

    // Ports stay reserved until every synthetic tunnel has one, so no two
    // of them are handed the same port. The entrance binds them again later.
    let mut reserved = Vec::new();

    for (name, jump_name) in clients {
        let jump = match hosts.get(&jump_name) {
            Some(jump) => jump,
            None if declared.contains(&jump_name) => continue,
            None => {
                errors.push(ConfigError::UndefinedJumpHost {
                    host: name,
                    jump_host: jump_name,
                });
                continue;
            }
        };

        if let Some(next_hop) = &jump.jump_host {
            errors.push(ConfigError::MultiHopJump {
                host: name,
                jump_host: jump_name.clone(),
                next_hop: next_hop.clone(),
            });
            continue;
        }

        let (listener, port) = match free_port() {
            Ok(found) => found,
            Err(e) => {
                errors.push(ConfigError::NoFreePort {
                    host: name,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        reserved.push(listener);

        let Some(host) = hosts.get_mut(&name) else {
            continue;
        };
        let entrance = Address::loopback(port);
        let tunnel = TunnelEntry {
            name: synthetic_name(&jump_name, tunnels),
            local: entrance.clone(),
            host: jump_name,
            forward: host.address.clone(),
            synthetic: true,
        };
        info!(
            "Host ({}) reached through tunnel ({}) at {}",
            host.name, tunnel.name, entrance
        );
        host.address = entrance;
        tunnels.push(tunnel);
    }
}

/// `"<jump> jumphost"`, numbered when one jump host fronts several hosts
fn synthetic_name(jump_name: &str, tunnels: &[TunnelEntry]) -> String {
    let base = format!("{} {}", jump_name, JUMP_TUNNEL_SUFFIX);
    let taken = |candidate: &str| tunnels.iter().any(|t| t.name == candidate);
    if !taken(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{} {}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

/// Reserve an ephemeral loopback port
///
/// The listener must be dropped before the synthetic tunnel binds the
/// port; something else could grab it in between.
fn free_port() -> std::io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}
