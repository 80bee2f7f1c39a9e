//! Offline verification of an export archive. Needs no network access and
//! no access to the service.
//!
//! ```bash
//! custodian-verify export.tar --public-key <hex> [--log-key <hex>] [--json]
//! ```
//!
//! Exits 0 when every check passes, 1 otherwise.
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use custodian::export::verify_archive;
use custodian::signing::public_key_from_hex;

/// Verify a custodian export archive
#[derive(Parser, Debug)]
#[command(name = "custodian-verify")]
#[command(about = "Check an export archive's signatures, digests, proofs and time-stamps", long_about = None)]
struct Args {
    /// Archive to verify
    archive: PathBuf,

    /// Hex Ed25519 key that signed index.json
    #[arg(short, long)]
    public_key: String,

    /// Hex Ed25519 key of the log; defaults to the key in checkpoint.json
    #[arg(short, long)]
    log_key: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn run(args: &Args) -> Result<bool> {
    let bytes = std::fs::read(&args.archive)
        .with_context(|| format!("reading {}", args.archive.display()))?;
    let export_key = public_key_from_hex(&args.public_key).context("--public-key")?;
    let log_key = args
        .log_key
        .as_deref()
        .map(public_key_from_hex)
        .transpose()
        .context("--log-key")?;

    let report = verify_archive(&bytes, &export_key, log_key.as_deref())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let Some(id) = &report.export_id {
            println!("export {id}: {} records", report.records);
        }
        for check in &report.checks {
            let mark = if check.passed { "PASS" } else { "FAIL" };
            match &check.detail {
                Some(detail) => println!("{mark} {:<24} {} ({detail})", check.name, check.target),
                None => println!("{mark} {:<24} {}", check.name, check.target),
            }
        }
        let failed = report.failures().count();
        println!(
            "{} checks, {failed} failed: {}",
            report.checks.len(),
            if report.passed() { "VERIFIED" } else { "NOT VERIFIED" }
        );
    }
    Ok(report.passed())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
