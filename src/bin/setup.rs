//! Creates (or with `--reset`, recreates) the log schema and reports
//! whether it matches what the service expects.
//!
//! ```bash
//! cargo run --bin setup -- --reset
//! ```
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

use anyhow::{Context, Result};
use clap::Parser;
use tokio_postgres::NoTls;

use custodian::log::schema::{apply_schema, validate_schema};

/// Database schema setup
#[derive(Parser, Debug)]
#[command(name = "setup")]
#[command(about = "Create the custodian log schema", long_about = None)]
struct Args {
    /// Drop the log tables first. Destroys the log.
    #[arg(long)]
    reset: bool,

    /// Only validate, change nothing
    #[arg(long, conflicts_with = "reset")]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let (client, connection) = tokio_postgres::connect(&db_url, NoTls).await?;

    // The connection object performs the actual communication with the database,
    // so spawn it off to run on its own.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });

    if !args.check {
        apply_schema(&client, args.reset).await?;
    }

    let mut valid = true;
    for table in validate_schema(&client).await? {
        if table.is_valid() {
            println!("✅ {}", table.table_name);
        } else {
            valid = false;
            for error in table.errors() {
                println!("❌ {error}");
            }
        }
    }

    if !valid {
        anyhow::bail!("schema does not match");
    }
    Ok(())
}
