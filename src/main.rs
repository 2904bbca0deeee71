//! Veil entry point: configuration, wiring, and graceful shutdown

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use veil::config::Config;
use veil::database::Database;
use veil::forward::ProxyServer;
use veil::pool::PoolManager;

#[derive(Parser)]
#[command(name = "veil", version, about = "Anonymizing rotating HTTP/HTTPS forward proxy")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Write the default configuration to veil.toml and exit
    #[arg(long)]
    gen_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veil=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if cli.gen_config {
        if let Err(e) = std::fs::write("veil.toml", Config::template()) {
            error!(error = %e, "Failed to write veil.toml");
            return ExitCode::FAILURE;
        }
        println!("Default config generated: veil.toml");
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> veil::Result<()> {
    info!("Starting Veil proxy server");

    let config = Config::load(cli.config.as_deref())?;
    info!("Configuration loaded");

    let db = Database::open(&config.database.path).await?;

    let manager = PoolManager::new(&db, &config);
    manager.start().await?;

    let server = ProxyServer::new(config.server.clone(), manager.clone());
    let (shutdown_tx, _) = watch::channel(false);

    let server_shutdown = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            error!(error = %e, "Proxy server error");
        }
    });

    info!(addr = %config.server.bind_addr(), "Veil started, press Ctrl+C to stop");

    shutdown_signal().await;
    info!("Shutdown signal received");

    // Background pipelines first, then the listener with a hard deadline
    manager.stop().await;

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .is_err()
    {
        error!("Proxy server did not stop within 10s");
    }

    db.close().await;
    info!("Veil stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
