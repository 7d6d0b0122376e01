use paasling::config::Config;
use paasling::context::Context;
use paasling::engine::DockerEngine;
use paasling::{server, sweeper};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(config.log_level.to_filter().into())
                .from_env_lossy(),
        )
        .init();

    info!(
        addr = %config.addr,
        network = %config.network,
        nginx = config.nginx,
        stop_timeout_secs = config.stop_timeout.as_secs(),
        start_timeout_secs = config.start_timeout.as_secs(),
        "Starting paasling"
    );

    let engine = Arc::new(DockerEngine::new().await.map_err(|e| {
        error!(error = %e, "Could not reach the container engine");
        e
    })?);

    let ctx = Context::new(config, engine);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(sweeper::run(Arc::clone(&ctx), shutdown_rx.clone()));

    let server_handle = tokio::spawn(server::run(ctx, shutdown_rx));

    wait_for_signal().await;
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");
    info!("Received Ctrl+C");
}
