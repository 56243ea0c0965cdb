//! Host connection manager
//!
//! A `Host` owns at most one authenticated session. Tunnels share it and
//! multiplex `direct-tcpip` channels over it. Session creation is
//! serialized by the host's mutex; channel creation runs concurrently once
//! the session exists.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Handle;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::client::{connect, ClientHandler};
use super::config::HostCredentials;
use super::error::SshError;
use crate::config::Address;
use crate::forwarding::{BoxedStream, HostDialer};

/// An established session that logical channels are opened over
#[async_trait]
pub trait HostSession: Send + Sync {
    /// Whether the underlying transport has gone away
    fn is_closed(&self) -> bool;

    /// Open a `direct-tcpip` channel to `destination`
    async fn open_channel(&self, destination: &Address) -> Result<BoxedStream, SshError>;
}

/// Establishes sessions for a `Host`
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        dial: &Address,
        identity: &Address,
        credentials: &HostCredentials,
    ) -> Result<Arc<dyn HostSession>, SshError>;
}

/// Connects real SSH sessions with russh
pub struct RusshConnector;

#[async_trait]
impl SessionConnector for RusshConnector {
    async fn connect(
        &self,
        dial: &Address,
        identity: &Address,
        credentials: &HostCredentials,
    ) -> Result<Arc<dyn HostSession>, SshError> {
        let handle = connect(dial, identity, credentials).await?;
        Ok(Arc::new(handle))
    }
}

#[async_trait]
impl HostSession for Handle<ClientHandler> {
    fn is_closed(&self) -> bool {
        Handle::is_closed(self)
    }

    async fn open_channel(&self, destination: &Address) -> Result<BoxedStream, SshError> {
        let channel = self
            .channel_open_direct_tcpip(
                destination.host(),
                u32::from(destination.port()),
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        Ok(Box::new(channel.into_stream()))
    }
}

pub struct Host {
    name: String,
    /// Where the session is dialed. For a jump-host client this is the
    /// loopback entrance of its synthetic tunnel.
    address: Address,
    /// Address from the configuration file, used for host key lookup
    configured_address: Address,
    credentials: HostCredentials,
    connector: Arc<dyn SessionConnector>,
    session: Mutex<Option<Arc<dyn HostSession>>>,
}

impl Host {
    pub fn new(
        name: String,
        address: Address,
        configured_address: Address,
        credentials: HostCredentials,
    ) -> Self {
        Self::with_connector(
            name,
            address,
            configured_address,
            credentials,
            Arc::new(RusshConnector),
        )
    }

    pub fn with_connector(
        name: String,
        address: Address,
        configured_address: Address,
        credentials: HostCredentials,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        Self {
            name,
            address,
            configured_address,
            credentials,
            connector,
            session: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Establish the shared session if there is none
    ///
    /// A session whose transport has gone away is replaced rather than
    /// reused. There is no retry: a failure is returned to the caller.
    pub async fn open(&self) -> Result<(), SshError> {
        let mut session = self.session.lock().await;

        if let Some(current) = session.as_ref() {
            if !current.is_closed() {
                return Ok(());
            }
            info!("Host ({}) session closed, reconnecting", self.name);
            *session = None;
        }

        match self
            .connector
            .connect(&self.address, &self.configured_address, &self.credentials)
            .await
        {
            Ok(established) => {
                info!("Host ({}) session established via {}", self.name, self.address);
                *session = Some(established);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Host ({}) failed to connect to remote address {}: {}",
                    self.name, self.address, e
                );
                Err(e)
            }
        }
    }

    /// Open a direct-tcpip channel to `destination`
    ///
    /// Requires a prior successful `open`. A dead session is not redialed here.
    pub async fn dial(&self, destination: &Address) -> Result<BoxedStream, SshError> {
        let session = self
            .session
            .lock()
            .await
            .clone()
            .ok_or_else(|| SshError::NotConnected(self.name.clone()))?;

        let stream = session.open_channel(destination).await.map_err(|e| {
            error!(
                "Host ({}) failed to call remote address {}: {}",
                self.name, destination, e
            );
            e
        })?;

        debug!("Host ({}) opened channel to {}", self.name, destination);
        Ok(stream)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("configured_address", &self.configured_address)
            .field("credentials", &self.credentials)
            .finish()
    }
}

#[async_trait]
impl HostDialer for Host {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), SshError> {
        Host::open(self).await
    }

    async fn dial(&self, destination: &Address) -> Result<BoxedStream, SshError> {
        Host::dial(self, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn credentials() -> HostCredentials {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/id_ed25519");
        let key = russh::keys::load_secret_key(path, None).unwrap();
        HostCredentials {
            username: "tester".into(),
            identity: Arc::new(key),
            known_hosts: None,
        }
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Session whose channels are in-memory pipes echoing the destination
    struct FakeSession {
        closed: AtomicBool,
    }

    #[async_trait]
    impl HostSession for FakeSession {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn open_channel(&self, destination: &Address) -> Result<BoxedStream, SshError> {
            let (near, mut far) = tokio::io::duplex(1024);
            far.write_all(destination.to_string().as_bytes()).await?;
            Ok(Box::new(near))
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        sessions: parking_lot::Mutex<Vec<Arc<FakeSession>>>,
    }

    #[async_trait]
    impl SessionConnector for CountingConnector {
        async fn connect(
            &self,
            _dial: &Address,
            _identity: &Address,
            _credentials: &HostCredentials,
        ) -> Result<Arc<dyn HostSession>, SshError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            // Give concurrent callers a chance to race
            tokio::time::sleep(Duration::from_millis(20)).await;
            let session = Arc::new(FakeSession {
                closed: AtomicBool::new(false),
            });
            self.sessions.lock().push(session.clone());
            Ok(session)
        }
    }

    fn fake_host(connector: Arc<CountingConnector>) -> Arc<Host> {
        let address = Address::loopback(22);
        Arc::new(Host::with_connector(
            "a".into(),
            address.clone(),
            address,
            credentials(),
            connector,
        ))
    }

    #[tokio::test]
    async fn test_dial_requires_open_session() {
        let address = Address::loopback(22);
        let host = Host::new("a".into(), address.clone(), address, credentials());
        let result = host.dial(&Address::loopback(80)).await;
        assert!(matches!(result, Err(SshError::NotConnected(name)) if name == "a"));
    }

    #[tokio::test]
    async fn test_open_reports_dial_failure() {
        let address = Address::loopback(closed_port());
        let host = Host::new("a".into(), address.clone(), address, credentials());
        assert!(host.open().await.is_err());
        // Nothing cached after a failure
        assert!(host.session.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_session() {
        let connector = Arc::new(CountingConnector::default());
        let host = fake_host(connector.clone());

        let opens: Vec<_> = (0..8)
            .map(|_| {
                let host = host.clone();
                tokio::spawn(async move { host.open().await })
            })
            .collect();
        for open in futures_util::future::join_all(opens).await {
            open.unwrap().unwrap();
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // Later opens reuse it too
        host.open().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        let mut channel = host.dial(&Address::loopback(5432)).await.unwrap();
        let mut buf = [0u8; 14];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"127.0.0.1:5432");
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let connector = Arc::new(CountingConnector::default());
        let host = fake_host(connector.clone());

        host.open().await.unwrap();
        connector.sessions.lock()[0].closed.store(true, Ordering::SeqCst);

        host.open().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        let sessions = connector.sessions.lock();
        assert!(!sessions[1].is_closed());
        let current = host.session.try_lock().unwrap().clone().unwrap();
        assert!(!current.is_closed());
    }
}
