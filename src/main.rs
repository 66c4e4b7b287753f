use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sendgate::config::{LogFormat, LoggingConfig, SendgateConfig};
use sendgate::daemon::Daemon;

/// Per-sender rate limiting policy daemon for Postfix.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to /etc/sendgate/sendgate.toml, then ./sendgate.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load configuration and map files, print a summary and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = SendgateConfig::load(args.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Sendgate policy daemon");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let daemon = Arc::new(Daemon::bootstrap(config)?);

    if args.check_config {
        let config = daemon.config();
        println!(
            "listen {}:{}, default limit {} per {}s, whitelist {}, domain limits {}, {} senders restored",
            config.server.listen_address,
            config.server.port,
            config.rate_limiting.default_limit,
            config.rate_limiting.window_secs,
            config.rate_limiting.whitelist_path.display(),
            config.rate_limiting.domain_list_path.display(),
            daemon.limiter().registry().len(),
        );
        return Ok(());
    }

    spawn_reload_handler(Arc::clone(&daemon))?;

    daemon.run_and_save(shutdown_signal()).await?;

    info!("Sendgate policy daemon stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Reload the map files on SIGHUP.
#[cfg(unix)]
fn spawn_reload_handler(daemon: Arc<Daemon>) -> anyhow::Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading map files");
            if let Err(e) = daemon.reload_maps_blocking().await {
                warn!(error = %e, "Reload failed, keeping previous tables");
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_handler(_daemon: Arc<Daemon>) -> anyhow::Result<()> {
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, saving state and shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, saving state and shutting down");
        }
    }
}
