use std::path::PathBuf;

use clap::Parser;

use crate::stats::DEFAULT_STATS_PORT;

#[derive(Parser, Debug)]
#[command(name = "ferret", about = "On-demand SSH tunnels", version)]
pub struct Cli {
    /// Configuration file (.yaml, .yml or .json). Default: ~/.ferret/config.yaml
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Loopback port for the stats channel
    #[arg(
        short = 'p',
        long,
        value_name = "PORT",
        default_value_t = DEFAULT_STATS_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub stats_port: u16,

    /// Run without the stats channel
    #[arg(long, conflicts_with = "stats_port")]
    pub no_stats: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Stats port, unless the stats channel is disabled
    pub fn stats_port(&self) -> Option<u16> {
        (!self.no_stats).then_some(self.stats_port)
    }
}
