//! Custody service: HTTP API plus the background checkpoint and sweep loop.
//!
//! ```bash
//! cargo run --bin custodian -- --bind 0.0.0.0:3000
//! ```

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use custodian::config::Config;
use custodian::service::{initialize_app_state, run_server};

/// Tamper-evident evidence custody service
#[derive(Parser, Debug)]
#[command(name = "custodian")]
#[command(about = "Serve the evidence custody API", long_about = None)]
struct Args {
    /// Listen address; overrides CUSTODIAN_BIND
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let addr = args.bind.unwrap_or(config.bind);

    tracing::info!(origin = %config.origin, "starting custodian");
    let app_state = initialize_app_state(&config).await?;
    run_server(app_state, &addr).await
}
