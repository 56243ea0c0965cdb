//! SSH Client implementation using russh

use std::sync::Arc;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{client_config, HostCredentials, CONNECT_TIMEOUT};
use super::error::SshError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use crate::config::Address;

/// Open and authenticate an SSH session
///
/// `dial` is where the TCP connection goes. `identity` is the address the
/// server is known by, which differs from `dial` when the host sits behind
/// a jump host and is reached through a loopback entrance.
pub async fn connect(
    dial: &Address,
    identity: &Address,
    credentials: &HostCredentials,
) -> Result<Handle<ClientHandler>, SshError> {
    info!("Connecting to SSH server at {}", dial);

    let handler = ClientHandler::new(
        identity.raw_host().to_string(),
        identity.port(),
        credentials.known_hosts.clone(),
    );

    let mut handle = tokio::time::timeout(
        CONNECT_TIMEOUT,
        client::connect(
            Arc::new(client_config()),
            (dial.host(), dial.port()),
            handler,
        ),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", dial)))??;

    debug!("SSH handshake with {} completed", dial);

    let key_with_hash = PrivateKeyWithHashAlg::new(credentials.identity.clone(), None);
    let authenticated = handle
        .authenticate_publickey(&credentials.username, key_with_hash)
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "Authentication to {} as {} rejected by server",
            identity, credentials.username
        )));
    }

    info!("SSH authentication to {} successful", identity);
    Ok(handle)
}

/// Client handler for russh callbacks
///
/// Only server key verification is customised; forwarded-tcpip and other
/// server-initiated channels are never requested.
pub struct ClientHandler {
    /// Host name the server key is recorded under
    host: String,
    port: u16,
    /// `None` accepts any server key
    known_hosts: Option<Arc<KnownHostsStore>>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, known_hosts: Option<Arc<KnownHostsStore>>) -> Self {
        Self {
            host,
            port,
            known_hosts,
        }
    }

    fn check_key(&self, server_public_key: &PublicKey) -> Result<bool, SshError> {
        let Some(known_hosts) = &self.known_hosts else {
            debug!(
                "No known_hosts configured for {}:{}, accepting {}",
                self.host,
                self.port,
                KnownHostsStore::fingerprint(server_public_key)
            );
            return Ok(true);
        };

        match known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}), rejecting",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} (fingerprint {}) is not in {}",
                    self.host,
                    self.port,
                    fingerprint,
                    known_hosts.path().display()
                )))
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SshError::HostKeyRejected(format!(
                "key for {}:{} has changed! Expected: {}, Actual: {}",
                self.host, self.port, expected_fingerprint, actual_fingerprint
            ))),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.check_key(server_public_key)
    }
}
