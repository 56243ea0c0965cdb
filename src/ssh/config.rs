//! SSH Configuration

use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;

use super::known_hosts::KnownHostsStore;

/// Timeout for TCP connect plus SSH handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive sent on idle sessions
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Missed keepalives before russh drops the session
pub const KEEPALIVE_MAX: usize = 3;

/// Credentials used to authenticate a host session
#[derive(Clone)]
pub struct HostCredentials {
    /// Username for authentication
    pub username: String,

    /// Decoded private key, shared between hosts using the same identity file
    pub identity: Arc<PrivateKey>,

    /// Server key verification; `None` accepts any key
    pub known_hosts: Option<Arc<KnownHostsStore>>,
}

impl std::fmt::Debug for HostCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCredentials")
            .field("username", &self.username)
            .field("identity", &self.identity.algorithm())
            .field(
                "known_hosts",
                &self.known_hosts.as_ref().map(|store| store.path().to_path_buf()),
            )
            .finish()
    }
}

/// russh client settings shared by every host session
pub fn client_config() -> russh::client::Config {
    russh::client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    }
}
