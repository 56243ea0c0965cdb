//! `host:port` endpoints
//!
//! Addresses come from configuration text and are validated exactly once.
//! Local addresses must resolve on this machine and are rewritten to their
//! IPv4 literal; remote addresses only have to make sense on the far side
//! of an SSH session, so a failed local lookup is only a warning.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

use thiserror::Error;
use tracing::warn;

/// Where an address is used, which decides how strictly it is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Bound or dialed from this machine
    Local,
    /// Dialed from the remote end of an SSH session
    Remote,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("({0}) is invalid. Required syntax is <ip address>:<port>")]
    Syntax(String),

    #[error("host ({0}) cannot be resolved")]
    Unresolvable(String),

    #[error("host ({0}) has no valid IP addresses associated with it")]
    NoAddresses(String),

    #[error("host ({0}) cannot be converted to a valid IPv4 address")]
    NotIpv4(String),

    #[error("port ({0}) is not a number")]
    PortSyntax(String),

    #[error("port ({0}) range is invalid. Must be between 1 and 65535")]
    PortRange(String),
}

/// A validated endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Host text as written in the configuration
    raw_host: String,
    /// Host used when dialing or binding (IPv4 literal for local scope)
    host: String,
    port: u16,
}

impl Address {
    /// Parse and validate `host:port`
    pub fn parse(raw: &str, scope: Scope) -> Result<Self, AddressError> {
        let raw = raw.trim();
        let mut parts = raw.split(':');
        let (raw_host, raw_port) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) if !host.is_empty() => (host, port),
            _ => return Err(AddressError::Syntax(raw.to_string())),
        };

        let port = parse_port(raw_port)?;
        let host = resolve_host(raw_host, scope)?;

        Ok(Self {
            raw_host: raw_host.to_string(),
            host,
            port,
        })
    }

    /// `127.0.0.1:<port>`, used for synthetic jump-host entrances
    pub fn loopback(port: u16) -> Self {
        let host = Ipv4Addr::LOCALHOST.to_string();
        Self {
            raw_host: host.clone(),
            host,
            port,
        }
    }

    /// `0.0.0.0:<port>`, the entrance used when a tunnel omits `local`
    pub fn unspecified(port: u16) -> Self {
        let host = Ipv4Addr::UNSPECIFIED.to_string();
        Self {
            raw_host: host.clone(),
            host,
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn raw_host(&self) -> &str {
        &self.raw_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_loopback(&self) -> bool {
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_port(raw: &str) -> Result<u16, AddressError> {
    let value: u32 = raw
        .trim()
        .parse()
        .map_err(|_| AddressError::PortSyntax(raw.to_string()))?;
    match u16::try_from(value) {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(AddressError::PortRange(raw.to_string())),
    }
}

fn resolve_host(raw_host: &str, scope: Scope) -> Result<String, AddressError> {
    let resolved: Vec<IpAddr> = match (raw_host, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            return match scope {
                Scope::Local => Err(AddressError::Unresolvable(raw_host.to_string())),
                Scope::Remote => {
                    warn!("Host ({}) cannot be resolved locally: {}", raw_host, e);
                    Ok(raw_host.to_string())
                }
            };
        }
    };

    if resolved.is_empty() {
        return Err(AddressError::NoAddresses(raw_host.to_string()));
    }

    match scope {
        Scope::Local => resolved
            .iter()
            .find(|ip| ip.is_ipv4())
            .map(|ip| ip.to_string())
            .ok_or_else(|| AddressError::NotIpv4(raw_host.to_string())),
        Scope::Remote => Ok(raw_host.to_string()),
    }
}
