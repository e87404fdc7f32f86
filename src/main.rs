use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use mysql_gateway::config::Cli;
use mysql_gateway::gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        addr = %config.addr,
        backends = config.backends.len(),
        tls = config.tls.is_enabled(),
        compress = config.compress,
        "initializing gateway"
    );

    let gateway = Gateway::bind(config).await?;
    let shutdown = gateway.shutdown_handle();
    let server = tokio::spawn(gateway.serve());

    shutdown_signal().await;
    warn!("received shutdown signal");
    shutdown.cancel();
    server.await?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
