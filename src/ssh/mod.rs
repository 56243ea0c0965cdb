//! SSH module - handles SSH sessions for tunnel hosts
//!
//! This module provides the SSH client side using the russh library.
//!
//! # Features
//! - One lazily established, shared session per host
//! - Public key authentication (optionally passphrase protected)
//! - Host key verification against a per-host known_hosts file
//! - `direct-tcpip` channels exposed as async byte streams

mod client;
mod config;
mod error;
mod host;
pub mod known_hosts;

pub use client::{connect, ClientHandler};
pub use config::{client_config, HostCredentials, CONNECT_TIMEOUT};
pub use error::SshError;
pub use host::{Host, HostSession, RusshConnector, SessionConnector};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
