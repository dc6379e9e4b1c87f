use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mockgate::config::Config;
use mockgate::gateway::server::GatewayServer;
use mockgate::gateway::GatewayEngine;
use mockgate::repository::{InMemoryStubRepository, InMemoryTrafficRepository};
use mockgate::session::InMemorySessionStore;

#[derive(Parser, Debug)]
#[command(
    name = "mockgate",
    about = "Session-isolated HTTP stubbing gateway with reverse-proxy fallback",
    version
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "MOCKGATE_CONFIG")]
    config: String,

    /// Override the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::from_file(&args.config)?;
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    info!(
        services = config.services.len(),
        port = config.listen.port,
        "starting mockgate"
    );

    let engine = GatewayEngine::new(
        config,
        Arc::new(InMemoryStubRepository::new()),
        Arc::new(InMemoryTrafficRepository::new()),
        Arc::new(InMemorySessionStore::new()),
    )?;
    let server = GatewayServer::bind(Arc::clone(&engine)).await?;
    server.run().await
}
