//! Stats Telemetry
//!
//! Live per-tunnel counters shared over a loopback TCP port. The port
//! doubles as a single-instance check: a second instance attaches to the
//! first one's feed instead of opening tunnels.

pub mod console;
mod frame;
mod manager;

pub use frame::{StatsFrameCodec, FRAME_BLOCK};
pub use manager::{
    try_bind_or_connect, StatsManager, StatsRole, StatsStartup, DEFAULT_STATS_PORT,
    STATS_INTERVAL, STATS_SETTLE,
};
