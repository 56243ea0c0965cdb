//! Stats Manager
//!
//! The first process to bind the stats port becomes the publisher: it
//! accepts subscribers and broadcasts tunnel counters to them. Any later
//! process finds the port taken, connects to it instead and shows the
//! publisher's feed until it goes away.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::console;
use super::frame::StatsFrameCodec;
use crate::forwarding::{StatsNotifier, TunnelStats, TunnelStatsSnapshot};

/// Default stats port
pub const DEFAULT_STATS_PORT: u16 = 2663;

/// Minimum time between two broadcasts
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before broadcasting once the interval has already passed, so a
/// burst of changes lands in one frame
pub const STATS_SETTLE: Duration = Duration::from_secs(1);

const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const SUBSCRIBER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of racing for the stats port
#[derive(Debug)]
pub enum StatsRole {
    /// This process owns the port
    Publisher(TcpListener),
    /// Another instance owns the port; connected to its feed
    Subscriber(TcpStream),
}

/// Bind the stats port on loopback, or connect to whoever already has it
pub async fn try_bind_or_connect(port: u16) -> io::Result<StatsRole> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(StatsRole::Publisher(listener)),
        Err(bind_err) => {
            debug!("Stats port {} unavailable ({}), attaching as subscriber", port, bind_err);
            let stream = timeout(SUBSCRIBER_CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connecting to stats port {} timed out", port),
                    )
                })??;
            Ok(StatsRole::Subscriber(stream))
        }
    }
}

/// What `StatsManager::start` ended up doing
#[derive(Debug)]
pub enum StatsStartup {
    /// Publishing in the background; tunnels should be started
    Publishing(JoinHandle<()>),
    /// Showed another instance's feed until it ended; nothing else to do
    Attached,
}

type SubscriberSink = Box<dyn AsyncWrite + Unpin + Send>;

struct Subscriber {
    peer: String,
    sink: SubscriberSink,
}

#[derive(Default)]
struct Subscribers {
    live: Vec<Subscriber>,
    /// Most recent frame, replayed to new subscribers
    last_frame: Option<Bytes>,
}

/// Process-wide stats service
pub struct StatsManager {
    notifier: StatsNotifier,
    updates: Mutex<Option<mpsc::Receiver<()>>>,
    tunnels: RwLock<Vec<Arc<TunnelStats>>>,
    subscribers: tokio::sync::Mutex<Subscribers>,
}

impl StatsManager {
    pub fn new() -> Arc<Self> {
        let (notifier, updates) = StatsNotifier::channel();
        Arc::new(Self {
            notifier,
            updates: Mutex::new(Some(updates)),
            tunnels: RwLock::new(Vec::new()),
            subscribers: tokio::sync::Mutex::new(Subscribers::default()),
        })
    }

    /// Sink that tunnels signal counter changes on
    pub fn notifier(&self) -> StatsNotifier {
        self.notifier.clone()
    }

    /// Include a tunnel's counters in every broadcast
    pub fn add_tunnel_stats(&self, stats: Arc<TunnelStats>) {
        self.tunnels.write().push(stats);
    }

    pub fn snapshot(&self) -> Vec<TunnelStatsSnapshot> {
        self.tunnels.read().iter().map(|s| s.snapshot()).collect()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.live.len()
    }

    /// Take the publisher role, or show the running publisher's feed
    pub async fn start(
        self: &Arc<Self>,
        port: u16,
        shutdown: CancellationToken,
    ) -> io::Result<StatsStartup> {
        match try_bind_or_connect(port).await? {
            StatsRole::Publisher(listener) => {
                info!("Stats listening on {}", port);
                Ok(StatsStartup::Publishing(self.publish(listener, shutdown)))
            }
            StatsRole::Subscriber(stream) => {
                let mut stdout = io::stdout();
                console::watch(stream, shutdown, &mut stdout).await;
                Ok(StatsStartup::Attached)
            }
        }
    }

    /// Serve subscribers on `listener` and broadcast until `shutdown`
    pub fn publish(self: &Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> JoinHandle<()> {
        let acceptor = tokio::spawn(self.clone().accept_loop(listener, shutdown.clone()));
        let broadcaster = self.spawn_broadcaster(shutdown);
        tokio::spawn(async move {
            if let Some(broadcaster) = broadcaster {
                let _ = broadcaster.await;
            }
            let _ = acceptor.await;
        })
    }

    fn spawn_broadcaster(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let Some(updates) = self.updates.lock().take() else {
            warn!("Stats broadcaster already running");
            return None;
        };
        Some(tokio::spawn(self.clone().broadcast_loop(updates, shutdown)))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            info!("Connected stats client {}", peer_addr);
                            self.add_subscriber(peer_addr.to_string(), Box::new(stream)).await;
                        }
                        Err(e) => {
                            error!("Stats listener accept failed: {}", e);
                            sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }
        debug!("Stats listener closed");
    }

    /// Register a subscriber, sending it the last frame right away
    async fn add_subscriber(&self, peer: String, mut sink: SubscriberSink) {
        let last_frame = self.subscribers.lock().await.last_frame.clone();
        if let Some(frame) = last_frame {
            if let Err(e) = write_frame(&mut sink, &frame).await {
                info!("Disconnected stats client {}: {}", peer, e);
                return;
            }
        }
        self.subscribers.lock().await.live.push(Subscriber { peer, sink });
    }

    /// Coalesce update signals into rate-limited broadcasts
    async fn broadcast_loop(self: Arc<Self>, mut updates: mpsc::Receiver<()>, shutdown: CancellationToken) {
        let mut last_broadcast: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                signal = updates.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    let delay = broadcast_delay(last_broadcast, Instant::now());
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                    // Signals raised while waiting are covered by this broadcast
                    while updates.try_recv().is_ok() {}
                    self.broadcast().await;
                    last_broadcast = Some(Instant::now());
                }
            }
        }

        self.close_subscribers().await;
        info!("Stats closed");
    }

    /// Send the current counters to every subscriber, pruning dead ones
    ///
    /// Writes run concurrently and outside the lock, so a stalled
    /// subscriber delays neither the others nor new registrations.
    async fn broadcast(&self) {
        let snapshot = self.snapshot();
        let mut frame = BytesMut::new();
        if let Err(e) = StatsFrameCodec.encode(snapshot.as_slice(), &mut frame) {
            warn!("Stats snapshot cannot be encoded: {}", e);
            return;
        }
        let frame = frame.freeze();

        let pending = {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.last_frame = Some(frame.clone());
            std::mem::take(&mut subscribers.live)
        };

        let results = join_all(pending.into_iter().map(|mut subscriber| {
            let frame = frame.clone();
            async move {
                let result = write_frame(&mut subscriber.sink, &frame).await;
                (subscriber, result)
            }
        }))
        .await;

        let mut subscribers = self.subscribers.lock().await;
        for (subscriber, result) in results {
            match result {
                Ok(()) => subscribers.live.push(subscriber),
                Err(e) => info!("Disconnected stats client {}: {}", subscriber.peer, e),
            }
        }
        debug!("Stats broadcast to {} client(s)", subscribers.live.len());
    }

    async fn close_subscribers(&self) {
        let mut subscribers = self.subscribers.lock().await;
        for mut subscriber in subscribers.live.drain(..) {
            let _ = subscriber.sink.shutdown().await;
        }
    }
}

impl std::fmt::Debug for StatsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsManager")
            .field("tunnels", &self.tunnels.read().len())
            .finish()
    }
}

/// Wait before the next broadcast: whatever is left of the interval, or
/// the settle delay once it has passed
fn broadcast_delay(last_broadcast: Option<Instant>, now: Instant) -> Duration {
    let remaining = last_broadcast
        .map(|at| (at + STATS_INTERVAL).saturating_duration_since(now))
        .unwrap_or(Duration::ZERO);
    if remaining.is_zero() {
        STATS_SETTLE
    } else {
        remaining
    }
}

/// A subscriber that cannot take a frame within the timeout counts as dead
async fn write_frame(sink: &mut SubscriberSink, frame: &[u8]) -> io::Result<()> {
    timeout(SUBSCRIBER_WRITE_TIMEOUT, async {
        sink.write_all(frame).await?;
        sink.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "stats write timed out"))?
}
