//! Subscriber console
//!
//! Prints one table per frame received from the running instance.

use std::io::Write;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::frame::StatsFrameCodec;
use crate::forwarding::TunnelStatsSnapshot;

/// Show the publisher's feed until it ends or `shutdown` is cancelled
pub async fn watch<R, W>(stream: R, shutdown: CancellationToken, out: &mut W)
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let _ = writeln!(out, "ferret already running");
    let mut feed = FramedRead::new(stream, StatsFrameCodec::new());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Stats subscriber cancelled");
                return;
            }

            frame = feed.next() => {
                match frame {
                    Some(Ok(stats)) => {
                        let _ = out.write_all(render_table(&stats).as_bytes());
                        let _ = out.flush();
                    }
                    Some(Err(e)) => {
                        warn!("Stats feed failed: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = writeln!(out, "ferret terminated or cannot be reached");
}

pub fn render_table(stats: &[TunnelStatsSnapshot]) -> String {
    let mut table = format!("{:<40} {:<15} {:<15} {:<6}\n", "Name", "Rcvd", "Sent", "Cnct");
    for tunnel in stats {
        table.push_str(&format!(
            "{:<40} {:<15} {:<15} {:<6}\n",
            tunnel.name,
            group_thousands(tunnel.received),
            group_thousands(tunnel.transmitted),
            group_thousands(tunnel.connections),
        ));
    }
    table
}

/// `1234567` -> `1,234,567`
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Encoder;

    fn snapshot(name: &str, received: u64) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            name: name.into(),
            connections: 2,
            received,
            transmitted: 1000,
        }
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
        assert_eq!(group_thousands(u64::MAX), "18,446,744,073,709,551,615");
    }

    #[test]
    fn test_render_table() {
        let table = render_table(&[snapshot("web", 1_234_567)]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Name"));
        assert!(lines[0].contains("Rcvd"));
        assert!(lines[1].starts_with("web "));
        assert!(lines[1].contains("1,234,567"));
        assert!(lines[1].contains("1,000"));
        assert_eq!(&lines[1][41..50], "1,234,567");
    }

    #[tokio::test]
    async fn test_watch_prints_frames_until_feed_ends() {
        let (mut publisher, feed) = tokio::io::duplex(4096);
        let mut frames = BytesMut::new();
        StatsFrameCodec
            .encode(&[snapshot("web", 5)][..], &mut frames)
            .unwrap();
        frames.extend_from_slice(b"garbage");
        frames.extend_from_slice(&[0u8; 249]);
        StatsFrameCodec
            .encode(&[snapshot("db", 6)][..], &mut frames)
            .unwrap();
        publisher.write_all(&frames).await.unwrap();
        drop(publisher);

        let mut out = Vec::new();
        watch(feed, CancellationToken::new(), &mut out).await;
        let out = String::from_utf8(out).unwrap();

        assert!(out.starts_with("ferret already running\n"));
        assert!(out.contains("\nweb "));
        assert!(out.contains("\ndb "));
        assert!(!out.contains("garbage"));
        assert!(out.ends_with("ferret terminated or cannot be reached\n"));
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let (_publisher, feed) = tokio::io::duplex(64);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let mut out = Vec::new();
        watch(feed, shutdown, &mut out).await;
        assert_eq!(String::from_utf8(out).unwrap(), "ferret already running\n");
    }
}
