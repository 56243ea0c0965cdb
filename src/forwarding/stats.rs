//! Per-tunnel traffic counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::events::StatsNotifier;

/// Live counters for one tunnel
///
/// Written only by the tunnel's own relay tasks and read by the stats
/// broadcaster. Each field is read atomically; a snapshot is not
/// consistent across fields.
#[derive(Debug)]
pub struct TunnelStats {
    name: String,
    connections: AtomicU64,
    /// Bytes read from local clients and sent into the tunnel
    received: AtomicU64,
    /// Bytes read from the tunnel and written back to local clients
    transmitted: AtomicU64,
    notifier: StatsNotifier,
}

/// Point-in-time copy of a tunnel's counters, as sent to stats subscribers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatsSnapshot {
    pub name: String,
    pub connections: u64,
    pub received: u64,
    pub transmitted: u64,
}

impl TunnelStats {
    pub fn new(name: impl Into<String>, notifier: StatsNotifier) -> Self {
        Self {
            name: name.into(),
            connections: AtomicU64::new(0),
            received: AtomicU64::new(0),
            transmitted: AtomicU64::new(0),
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.notifier.notify();
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
        self.notifier.notify();
    }

    pub fn add_transmitted(&self, bytes: u64) {
        self.transmitted.fetch_add(bytes, Ordering::Relaxed);
        self.notifier.notify();
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            name: self.name.clone(),
            connections: self.connections(),
            received: self.received(),
            transmitted: self.transmitted(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_signals() {
        let (notifier, mut rx) = StatsNotifier::channel();
        let stats = TunnelStats::new("web", notifier);

        stats.connection_opened();
        assert!(rx.try_recv().is_ok());
        stats.add_received(10);
        stats.add_received(5);
        stats.add_transmitted(7);

        assert_eq!(
            stats.snapshot(),
            TunnelStatsSnapshot {
                name: "web".into(),
                connections: 1,
                received: 15,
                transmitted: 7,
            }
        );
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_snapshot_json_field_names() {
        let stats = TunnelStats::new("db", StatsNotifier::noop());
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert_eq!(
            json,
            r#"{"name":"db","connections":0,"received":0,"transmitted":0}"#
        );
    }
}
