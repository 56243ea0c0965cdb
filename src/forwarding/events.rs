//! Stats Event System
//!
//! Tunnels signal every counter change through a `StatsNotifier`. The
//! signal carries no value: the stats broadcaster reads the counters itself
//! and coalesces bursts, so a full sink simply drops the extra signal.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Signal sink for tunnel counter changes
///
/// Can be a no-op for testing or when the stats channel is disabled.
#[derive(Clone)]
pub struct StatsNotifier {
    tx: Option<mpsc::Sender<()>>,
}

impl StatsNotifier {
    /// Create a notifier and the receiver the broadcaster listens on
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        // One slot: a pending signal already covers any that follow it
        let (tx, rx) = mpsc::channel(1);
        (Self { tx: Some(tx) }, rx)
    }

    /// Create a no-op notifier
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Signal that some counter changed. Never blocks.
    pub fn notify(&self) {
        if let Some(ref tx) = self.tx {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Closed(())) => {
                    tracing::trace!("Stats broadcaster gone, dropping update signal");
                }
            }
        }
    }
}

impl std::fmt::Debug for StatsNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsNotifier")
            .field("has_sink", &self.tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_notifier() {
        let notifier = StatsNotifier::noop();
        // Should not panic
        notifier.notify();
        notifier.notify();
    }

    #[test]
    fn test_burst_is_coalesced() {
        let (notifier, mut rx) = StatsNotifier::channel();
        for _ in 0..100 {
            notifier.notify();
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_notify_after_receiver_dropped() {
        let (notifier, rx) = StatsNotifier::channel();
        drop(rx);
        notifier.notify();
    }
}
