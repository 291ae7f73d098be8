use anyhow::Context;
use clap::Parser;
use em_history_sync::{storage, AppContext, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Mirror energy-meter history into InfluxDB.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Config file, or a directory holding default.yaml and <APP_ENV>.yaml.
    #[arg(short, long, env = "APP_CONFIG", default_value = "config")]
    config: String,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "starting em-history-sync");

    let cfg = Config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;
    info!(devices = cfg.devices.len(), "loaded config");
    if args.check {
        info!("configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let store = storage::from_config(
        &cfg.storage,
        cfg.sync.request_timeout(),
        shutdown.clone(),
    )?;
    let ctx = AppContext::new(store, cfg.sync.clone(), shutdown.clone());

    tokio::spawn(shutdown_signal(shutdown.clone()));

    if ctx.wait_for_storage().await {
        for device in cfg.devices {
            let name = device.device_name().to_string();
            if let Err(e) = ctx.spawn_device(device) {
                error!(device = %name, error = %e, "failed to start device");
            }
        }
        shutdown.cancelled().await;
    }

    if let Err(e) = ctx.shutdown().await {
        error!(error = %e, "shutdown failed");
        return Err(e.into());
    }
    info!("shutdown complete");
    Ok(())
}

/// Cancel the token on Ctrl+C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
