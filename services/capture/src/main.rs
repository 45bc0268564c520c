use std::sync::Arc;

use capture::config::CaptureConfig;
use capture::postgres::PgSink;
use capture::supervisor::FeedSupervisor;
use capture::symbols::run_refresh;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = capture::SERVICE_VERSION, "Starting capture service");

    let config = CaptureConfig::from_env()?;
    let sink = Arc::new(PgSink::connect(&config.storage).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let symbols = config.symbols.enabled.then(|| {
        tokio::spawn(run_refresh(config.symbols.clone(), sink.clone(), shutdown_rx.clone()))
    });

    let supervisor = FeedSupervisor::new(&config, sink);
    let feed = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    shutdown_tx.send(true)?;

    feed.await?;
    if let Some(symbols) = symbols {
        symbols.await?;
    }

    tracing::info!("Capture service stopped");
    Ok(())
}
