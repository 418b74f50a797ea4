//! `moleportd` — background SSH connection and port-forwarding supervisor.
//!
//! Thin entry point: parse arguments, init tracing, bootstrap the daemon
//! (C10), then run until a shutdown signal or `daemon.shutdown` RPC call.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use moleport::daemon::Daemon;
use moleport::datadir::ConfigDir;

#[derive(Parser)]
#[command(name = "moleportd")]
#[command(author, version, about = "moleport daemon")]
struct Args {
    /// Override the config directory (defaults to $MOLEPORT_CONFIG_DIR,
    /// $XDG_CONFIG_HOME/moleport, or ~/.config/moleport).
    #[arg(long)]
    config_dir: Option<std::path::PathBuf>,

    /// Enable verbose (debug) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config_dir = ConfigDir::resolve(args.config_dir);
    let _ = config_dir.ensure_exists();
    let precheck_cfg = moleport::config::Config::load(&config_dir.config_path()).unwrap_or_default();

    let default_level = if args.verbose { "debug".to_string() } else { precheck_cfg.log.level.clone() };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Keep the worker guard alive for the process lifetime so buffered
    // lines are flushed; dropping it silently stops the appender.
    let _log_guard = match &precheck_cfg.log.file {
        Some(path) if !path.as_os_str().is_empty() => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("cannot open log file {}: {e}", path.display()));
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
            }
            let (appender, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(appender).init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "moleportd starting");

    let daemon = match Daemon::bootstrap(config_dir).await {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to start moleportd");
            return std::process::ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    if let Err(e) = daemon.run(shutdown).await {
        error!(error = %e, "moleportd exited with error");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
