//! Bidirectional byte relay for one accepted connection
//!
//! Two copy tasks run independently, one per direction. When the first
//! one finishes the relay is half-closed: an auto-closer is scheduled that
//! gives the other direction up to `AUTO_CLOSE_GRACE` to drain before both
//! streams are forcibly dropped. If the second direction finishes first,
//! the auto-closer is released immediately.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::TunnelStats;

/// How long a half-closed relay may live
pub const AUTO_CLOSE_GRACE: Duration = Duration::from_secs(30);

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Copy directions currently running, across all tunnels
static ACTIVE_DIRECTIONS: AtomicI64 = AtomicI64::new(0);

fn active_directions() -> i64 {
    ACTIVE_DIRECTIONS.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Local client -> forward destination, counted as `received`
    Upstream,
    /// Forward destination -> local client, counted as `transmitted`
    Downstream,
}

impl Direction {
    fn record(self, stats: &TunnelStats, bytes: u64) {
        match self {
            Direction::Upstream => stats.add_received(bytes),
            Direction::Downstream => stats.add_transmitted(bytes),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upstream => f.write_str("transmit"),
            Direction::Downstream => f.write_str("receive"),
        }
    }
}

/// How a copy direction ended
#[derive(Debug)]
enum DirectionEnd {
    /// Clean end-of-stream after `u64` bytes
    Eof(u64),
    /// I/O failure on either side
    Failed(io::Error),
    /// Dropped by the auto-closer
    ForceClosed,
}

/// Relay bytes between `local` and `remote` until both directions end or
/// the auto-closer gives up on a half-closed relay.
pub async fn relay<L, R>(
    tunnel: &str,
    id: u64,
    local: L,
    remote: R,
    stats: Arc<TunnelStats>,
    grace: Duration,
) where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let force_close = CancellationToken::new();

    let mut upstream = spawn_direction(
        Direction::Upstream,
        local_read,
        remote_write,
        stats.clone(),
        force_close.clone(),
    );
    let mut downstream = spawn_direction(
        Direction::Downstream,
        remote_read,
        local_write,
        stats,
        force_close.clone(),
    );

    let ((first, first_end), (second, remaining)) = tokio::select! {
        end = &mut upstream => ((Direction::Upstream, end), (Direction::Downstream, downstream)),
        end = &mut downstream => ((Direction::Downstream, end), (Direction::Upstream, upstream)),
    };
    log_end(tunnel, id, first, first_end);

    let both_done = CancellationToken::new();
    let closer = tokio::spawn(auto_close(
        tunnel.to_string(),
        id,
        grace,
        both_done.clone(),
        force_close,
    ));

    log_end(tunnel, id, second, remaining.await);
    both_done.cancel();
    let _ = closer.await;

    debug!(
        "Tunnel ({}) id:{} c:{} connection closed",
        tunnel,
        id,
        active_directions()
    );
}

fn spawn_direction<S, D>(
    direction: Direction,
    src: S,
    dst: D,
    stats: Arc<TunnelStats>,
    force_close: CancellationToken,
) -> JoinHandle<DirectionEnd>
where
    S: AsyncRead + Unpin + Send + 'static,
    D: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        ACTIVE_DIRECTIONS.fetch_add(1, Ordering::Relaxed);
        let end = tokio::select! {
            result = copy_counted(src, dst, direction, &stats) => match result {
                Ok(total) => DirectionEnd::Eof(total),
                Err(e) => DirectionEnd::Failed(e),
            },
            _ = force_close.cancelled() => DirectionEnd::ForceClosed,
        };
        ACTIVE_DIRECTIONS.fetch_sub(1, Ordering::Relaxed);
        end
    })
}

/// Copy until end-of-stream, counting every successful write
///
/// On clean end-of-stream the write side is shut down so the peer sees EOF
/// while the opposite direction keeps draining.
async fn copy_counted<S, D>(
    mut src: S,
    mut dst: D,
    direction: Direction,
    stats: &TunnelStats,
) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            if let Err(e) = dst.shutdown().await {
                debug!("{} shutdown after EOF failed: {}", direction, e);
            }
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        total += n as u64;
        direction.record(stats, n as u64);
    }
}

/// Wait for the other direction or the grace period, then drop both streams
async fn auto_close(
    tunnel: String,
    id: u64,
    grace: Duration,
    both_done: CancellationToken,
    force_close: CancellationToken,
) {
    debug!(
        "Tunnel ({}) id:{} c:{} auto-closer initiated",
        tunnel,
        id,
        active_directions()
    );
    let status = tokio::select! {
        _ = tokio::time::sleep(grace) => "triggered",
        _ = both_done.cancelled() => "terminated",
    };
    force_close.cancel();
    debug!(
        "Tunnel ({}) id:{} c:{} auto-closer {}",
        tunnel,
        id,
        active_directions(),
        status
    );
}

fn log_end(tunnel: &str, id: u64, direction: Direction, end: Result<DirectionEnd, tokio::task::JoinError>) {
    match end {
        Ok(DirectionEnd::Eof(total)) => debug!(
            "Tunnel ({}) id:{} c:{} {} closed after {} bytes",
            tunnel,
            id,
            active_directions(),
            direction,
            total
        ),
        Ok(DirectionEnd::Failed(e)) => warn!(
            "Tunnel ({}) id:{} {} encountered a closed tunnel: {}",
            tunnel, id, direction, e
        ),
        Ok(DirectionEnd::ForceClosed) => debug!(
            "Tunnel ({}) id:{} {} closed by auto-closer",
            tunnel, id, direction
        ),
        Err(e) => warn!("Tunnel ({}) id:{} {} task failed: {}", tunnel, id, direction, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::StatsNotifier;
    use tokio::io::duplex;

    fn stats() -> Arc<TunnelStats> {
        Arc::new(TunnelStats::new("t", StatsNotifier::noop()))
    }

    #[tokio::test]
    async fn test_relays_both_directions_and_counts() {
        let (mut client, local) = duplex(1024);
        let (remote, mut server) = duplex(1024);
        let stats = stats();

        let relay_task = tokio::spawn(relay("t", 1, local, remote, stats.clone(), AUTO_CLOSE_GRACE));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"hi back").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi back");

        assert_eq!(stats.received(), 5);
        assert_eq!(stats.transmitted(), 7);

        drop(client);
        drop(server);
        relay_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_directions_ending_skips_grace() {
        let (client, local) = duplex(1024);
        let (remote, server) = duplex(1024);

        let started = tokio::time::Instant::now();
        let relay_task = tokio::spawn(relay("t", 2, local, remote, stats(), AUTO_CLOSE_GRACE));
        drop(client);
        drop(server);

        relay_task.await.unwrap();
        assert!(started.elapsed() < AUTO_CLOSE_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_closed_relay_is_bounded_by_grace() {
        let (mut client, local) = duplex(1024);
        let (remote, mut server) = duplex(1024);
        let stats = stats();

        let relay_task = tokio::spawn(relay("t", 3, local, remote, stats.clone(), AUTO_CLOSE_GRACE));

        // Client stops writing; the destination sees EOF but keeps its side open
        client.shutdown().await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);

        // Still open inside the grace period: data keeps flowing downstream
        tokio::time::sleep(Duration::from_secs(10)).await;
        server.write_all(b"late").await.unwrap();
        let mut late = [0u8; 4];
        client.read_exact(&mut late).await.unwrap();
        assert_eq!(&late, b"late");

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!relay_task.is_finished());

        // Past the grace period both streams are dropped
        tokio::time::timeout(Duration::from_secs(10), relay_task)
            .await
            .expect("relay should close after the grace period")
            .unwrap();
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stats.transmitted(), 4);
    }

    #[tokio::test]
    async fn test_counters_never_exceed_relayed_bytes() {
        let (mut client, local) = duplex(64);
        let (remote, mut server) = duplex(64);
        let stats = stats();

        let relay_task = tokio::spawn(relay("t", 4, local, remote, stats.clone(), AUTO_CLOSE_GRACE));

        let payload = vec![7u8; 100_000];
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut seen = 0u64;
        let mut last = 0u64;
        let mut buf = [0u8; 4096];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen += n as u64;
            let current = stats.received();
            assert!(current >= last);
            // Bytes counted are written to the destination, at most one
            // duplex buffer ahead of what it has read so far
            assert!(current <= seen + 64);
            last = current;
        }
        assert_eq!(seen, 100_000);
        assert_eq!(stats.received(), 100_000);

        drop(writer.await.unwrap());
        drop(server);
        relay_task.await.unwrap();
    }
}
