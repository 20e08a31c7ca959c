use std::sync::Arc;

use anyhow::Context;
use payment_watch::feed::WsDialer;
use payment_watch::store::MemoryStore;
use payment_watch::{Config, PaymentGateway, server};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load().context("invalid configuration")?;
    if config.receivers.is_empty() {
        warn!("no receivers configured, payments must name their receiver");
    }

    let shutdown = CancellationToken::new();
    let (gateway, results) = PaymentGateway::new(
        &config,
        Arc::new(WsDialer),
        Arc::new(MemoryStore::new()),
        shutdown.clone(),
    );
    gateway.start(results);

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        signal.cancel();
    });

    server::serve(listener, Arc::clone(&gateway), shutdown.clone()).await?;
    gateway.shutdown().await;
    Ok(())
}
