//! Tunnel forwarding engine
//!
//! A tunnel listens on a local address and, for each inbound connection,
//! opens a stream to its forward address through its host's shared SSH
//! session, then relays bytes both ways.
//! Example: 127.0.0.1:9000 -> (host A) -> 10.0.0.5:80

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dialer::HostDialer;
use super::events::StatsNotifier;
use super::relay::{relay, AUTO_CLOSE_GRACE};
use super::stats::TunnelStats;
use crate::config::Address;
use crate::ssh::SshError;

/// Process-wide connection id source, for log correlation
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Delay before retrying after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A local entrance forwarded through a host
pub struct Tunnel {
    name: String,
    local: Address,
    forward: Address,
    host: Arc<dyn HostDialer>,
    stats: Arc<TunnelStats>,
}

impl Tunnel {
    pub fn new(
        name: impl Into<String>,
        local: Address,
        host: Arc<dyn HostDialer>,
        forward: Address,
        notifier: StatsNotifier,
    ) -> Self {
        let name = name.into();
        Self {
            stats: Arc::new(TunnelStats::new(name.clone(), notifier)),
            name,
            local,
            forward,
            host,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn forward(&self) -> &Address {
        &self.forward
    }

    pub fn host_name(&self) -> &str {
        self.host.name()
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        self.stats.clone()
    }

    /// Bind the local entrance
    pub async fn bind(&self) -> Result<TcpListener, SshError> {
        let local = self.local.to_string();
        TcpListener::bind(&local).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => SshError::ConnectionFailed(format!(
                "Port already in use: {}. Another application may be using this port.",
                local
            )),
            std::io::ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                local
            )),
            std::io::ErrorKind::AddrNotAvailable => SshError::ConnectionFailed(format!(
                "Address not available: {}. The specified address is not valid on this system.",
                local
            )),
            _ => SshError::ConnectionFailed(format!("Failed to bind to {}: {}", local, e)),
        })
    }

    /// Open the tunnel and serve it until `shutdown` is cancelled
    ///
    /// `ready` receives `true` once the entrance is listening, or `false`
    /// if it could not be bound, in which case this returns immediately.
    pub async fn open(self: Arc<Self>, shutdown: CancellationToken, ready: oneshot::Sender<bool>) {
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Tunnel ({}) entrance ({}) cannot be created: {}", self.name, self.local, e);
                let _ = ready.send(false);
                return;
            }
        };

        info!(
            "Tunnel ({}) entrance opened at {} -> {} via {}",
            self.name,
            self.local,
            self.forward,
            self.host.name()
        );
        let _ = ready.send(true);

        self.serve(listener, shutdown).await;
    }

    /// Accept connections on `listener` until `shutdown` is cancelled
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Tunnel ({}) stopped listening on {}", self.name, self.local);
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            // Disable Nagle's algorithm for low-latency forwarding
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            info!("Connected tunnel ({}) from {}", self.name, peer_addr);

                            let tunnel = self.clone();
                            tokio::spawn(async move {
                                tunnel.forward_connection(stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Tunnel ({}) listener accept failed: {}", self.name, e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    /// Handle a single accepted connection
    ///
    /// A failure to reach the host or the destination drops the client
    /// connection without any further signal to the client.
    async fn forward_connection(&self, local: TcpStream, peer_addr: SocketAddr) {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        self.stats.connection_opened();

        debug!(
            "Tunnel ({}) id:{} connecting {} to forward server {}",
            self.name, id, peer_addr, self.forward
        );

        if let Err(e) = self.host.open().await {
            warn!("Tunnel ({}) id:{} host ({}) unavailable: {}", self.name, id, self.host.name(), e);
            return;
        }

        let remote = match self.host.dial(&self.forward).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Tunnel ({}) id:{} cannot reach {}: {}", self.name, id, self.forward, e);
                return;
            }
        };

        relay(&self.name, id, local, remote, self.stats.clone(), AUTO_CLOSE_GRACE).await;
        debug!("Tunnel ({}) id:{} closing connection {}", self.name, id, peer_addr);
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("host", &self.host.name())
            .field("forward", &self.forward)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scope;
    use crate::forwarding::BoxedStream;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Dials destinations directly over TCP instead of through SSH
    struct DirectDialer {
        opens: AtomicUsize,
        dialed: parking_lot::Mutex<Vec<String>>,
        fail_open: bool,
    }

    impl DirectDialer {
        fn new(fail_open: bool) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                dialed: parking_lot::Mutex::new(Vec::new()),
                fail_open,
            })
        }
    }

    #[async_trait]
    impl HostDialer for DirectDialer {
        fn name(&self) -> &str {
            "direct"
        }

        async fn open(&self) -> Result<(), SshError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(SshError::ConnectionFailed("refused".into()));
            }
            Ok(())
        }

        async fn dial(&self, destination: &Address) -> Result<BoxedStream, SshError> {
            self.dialed.lock().push(destination.to_string());
            let stream = TcpStream::connect(destination.to_string()).await?;
            Ok(Box::new(stream))
        }
    }

    async fn echo_server() -> Address {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        Address::loopback(port)
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn open_tunnel(tunnel: Arc<Tunnel>, shutdown: CancellationToken) -> (bool, tokio::task::JoinHandle<()>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(tunnel.open(shutdown, ready_tx));
        (ready_rx.await.unwrap(), handle)
    }

    #[tokio::test]
    async fn test_forwards_through_host_and_counts_connection() {
        let destination = echo_server().await;
        let dialer = DirectDialer::new(false);
        let local = Address::parse(&format!("127.0.0.1:{}", free_port()), Scope::Local).unwrap();
        let tunnel = Arc::new(Tunnel::new(
            "T1",
            local.clone(),
            dialer.clone(),
            destination.clone(),
            StatsNotifier::noop(),
        ));
        let stats = tunnel.stats();
        let shutdown = CancellationToken::new();

        let (ready, serve) = open_tunnel(tunnel, shutdown.clone()).await;
        assert!(ready);

        let mut client = TcpStream::connect(local.to_string()).await.unwrap();
        assert_eq!(client.peer_addr().unwrap().to_string(), local.to_string());
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Counters are bumped right after each write completes
        for _ in 0..100 {
            if stats.received() == 4 && stats.transmitted() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.connections(), 1);
        assert_eq!(stats.received(), 4);
        assert_eq!(stats.transmitted(), 4);
        assert_eq!(dialer.dialed.lock().as_slice(), &[destination.to_string()]);

        shutdown.cancel();
        serve.await.unwrap();
        assert!(TcpStream::connect(local.to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_signals_not_ready() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let tunnel = Arc::new(Tunnel::new(
            "busy",
            Address::loopback(port),
            DirectDialer::new(false),
            Address::loopback(80),
            StatsNotifier::noop(),
        ));

        let (ready, serve) = open_tunnel(tunnel, CancellationToken::new()).await;
        assert!(!ready);
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_host_failure_drops_client() {
        let dialer = DirectDialer::new(true);
        let local = Address::loopback(free_port());
        let tunnel = Arc::new(Tunnel::new(
            "down",
            local.clone(),
            dialer.clone(),
            Address::loopback(80),
            StatsNotifier::noop(),
        ));
        let stats = tunnel.stats();
        let shutdown = CancellationToken::new();
        let (ready, serve) = open_tunnel(tunnel, shutdown.clone()).await;
        assert!(ready);

        let mut client = TcpStream::connect(local.to_string()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(stats.connections(), 1);
        assert_eq!(dialer.opens.load(Ordering::SeqCst), 1);
        assert!(dialer.dialed.lock().is_empty());

        shutdown.cancel();
        serve.await.unwrap();
    }
}
