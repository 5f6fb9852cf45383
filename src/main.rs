use std::sync::Arc;

use h1loop::app::HelloApp;
use h1loop::config::ServerOptions;
use h1loop::server::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("h1loop=info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let options = ServerOptions::load()?;
    let server = Server::start(&options, Arc::new(HelloApp))?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    if !server.shutdown().await {
        tracing::warn!("Some connections were aborted during shutdown");
    }

    Ok(())
}
