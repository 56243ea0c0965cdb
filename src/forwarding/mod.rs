//! Port Forwarding Module
//!
//! Local entrances forwarded through SSH hosts, with per-tunnel traffic
//! counters feeding the stats channel.

mod dialer;
mod events;
mod relay;
mod stats;
mod tunnel;

pub use dialer::{BoxedStream, HostDialer, RelayStream};
pub use events::StatsNotifier;
pub use relay::AUTO_CLOSE_GRACE;
pub use stats::{TunnelStats, TunnelStatsSnapshot};
pub use tunnel::Tunnel;
