use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use floodgate::clock::SystemClock;
use floodgate::config::Config;
use floodgate::limiter::RateLimitEngine;
use floodgate::server::Server;

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Adaptive rate limiting and throttling service")]
struct Args {
    /// Override the bind address from the environment
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the log filter level
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();
    let mut config =
        Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(log) = args.log {
        config.log_level = log;
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("floodgate={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting floodgate");
    tracing::info!(bind_addr = %config.bind_addr, "Configuration loaded");

    let engine = Arc::new(RateLimitEngine::new(Arc::new(SystemClock)).with_default_rules());

    Server::new(&config, engine)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
