//! Ferret - on-demand SSH tunnels
//!
//! Local entrances forwarded through SSH hosts, with single-hop jump-host
//! chaining and a loopback stats channel that a second instance can
//! attach to.

pub mod cli;
pub mod config;
pub mod forwarding;
pub mod registry;
pub mod ssh;
pub mod stats;

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;
use config::{default_config_file, Configuration};
use forwarding::{StatsNotifier, Tunnel};
use registry::{Registry, TunnelSet};
use stats::{StatsManager, StatsStartup};

/// Time given to in-flight closures between cancellation and exit
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Initialize logging
///
/// Logs go to stderr; stdout belongs to the stats table.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Run until shut down
///
/// Returns success only when this process attached to another instance's
/// stats feed. Running tunnels only ever stop on shutdown, which exits 1.
pub async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_file()?,
    };
    debug!("Using config file: {}", config_path.display());

    let config = Configuration::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let registry = Registry::validate(&config, &whoami::username())
        .context("Invalid configuration")?;
    if registry.tunnels().is_empty() {
        bail!("No tunnels configured in {}", config_path.display());
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(monitor_shutdown(shutdown.clone()));

    let (manager, publisher) = match cli.stats_port() {
        Some(port) => {
            let manager = StatsManager::new();
            match manager
                .start(port, shutdown.clone())
                .await
                .with_context(|| format!("Failed to start stats on port {}", port))?
            {
                StatsStartup::Attached => return Ok(ExitCode::SUCCESS),
                StatsStartup::Publishing(publisher) => (Some(manager), Some(publisher)),
            }
        }
        None => {
            info!("Stats disabled");
            (None, None)
        }
    };

    let notifier = manager
        .as_ref()
        .map(|m| m.notifier())
        .unwrap_or_else(StatsNotifier::noop);
    let tunnels = registry.build_tunnels(&notifier);
    if let Some(manager) = &manager {
        for tunnel in tunnels.iter() {
            manager.add_tunnel_stats(tunnel.stats());
        }
    }

    open_tunnels(tunnels, shutdown.clone()).await;

    if let Some(publisher) = publisher {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, publisher).await;
    }
    info!("All tunnels closed. Stopped");
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(ExitCode::FAILURE)
}

/// Open every tunnel and wait for all of them to close
///
/// Jump tunnels are opened first and every one of them must be listening
/// before the direct tunnels start, since a direct tunnel's host may only
/// be reachable through one. Any tunnel that cannot bind its entrance shuts
/// the whole process down.
async fn open_tunnels(tunnels: TunnelSet, shutdown: CancellationToken) {
    let mut tasks = JoinSet::new();

    let jump_ready: Vec<_> = tunnels
        .jump
        .into_iter()
        .map(|tunnel| spawn_tunnel(&mut tasks, tunnel, &shutdown))
        .collect();
    let mut jumps_up = true;
    for (name, ready) in join_all(jump_ready).await {
        if !ready {
            error!("Tunnel ({}) failed to start, shutting down", name);
            jumps_up = false;
        }
    }

    if !jumps_up {
        shutdown.cancel();
    } else if !shutdown.is_cancelled() {
        for tunnel in tunnels.direct {
            let ready = spawn_tunnel(&mut tasks, tunnel, &shutdown);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let (name, ready) = ready.await;
                if !ready {
                    error!("Tunnel ({}) failed to start, shutting down", name);
                    shutdown.cancel();
                }
            });
        }
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("Tunnel task failed: {}", e);
        }
    }
}

/// Start `tunnel` on `tasks`; the returned future resolves once it is
/// listening (`true`) or has given up (`false`)
fn spawn_tunnel(
    tasks: &mut JoinSet<()>,
    tunnel: Arc<Tunnel>,
    shutdown: &CancellationToken,
) -> impl Future<Output = (String, bool)> + Send + 'static {
    let (ready_tx, ready_rx) = oneshot::channel();
    let name = tunnel.name().to_string();
    tasks.spawn(tunnel.open(shutdown.clone(), ready_tx));
    async move { (name, ready_rx.await.unwrap_or(false)) }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn monitor_shutdown(shutdown: CancellationToken) {
    wait_for_signal().await;
    info!("Terminating");
    shutdown.cancel();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                None
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received Ctrl+C"),
                Err(e) => {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            },
            _ = async {
                match sigterm.as_mut() {
                    Some(sigterm) => { sigterm.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    }
}
