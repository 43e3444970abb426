// ABOUTME: CLI entry point for mirror-check
// ABOUTME: Parses arguments, wires up the catalog and replication control, runs the audit

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mirror_check::{
    AuditConfig, AuditError, CategorySelection, CommandControl, JsonCatalog, ReplicaAuditor,
};

#[derive(Debug, Parser)]
#[command(
    name = "mirror-check",
    version,
    about = "Verifies that a primary data directory and its replication mirror hold equivalent relation files.",
    long_about = None
)]
struct Cli {
    /// Primary storage root (the directory containing base/<database>).
    #[arg(long, value_name = "DIR")]
    primary: PathBuf,

    /// Mirror storage root.
    #[arg(long, value_name = "DIR")]
    mirror: PathBuf,

    /// Name of the per-database subtree under base/ on both sides.
    #[arg(long, value_name = "NAME")]
    database: String,

    /// Comma-separated relation categories to check
    /// (btree, hash, gist, gin, bitmap, heap, sequence, ao, all).
    #[arg(long, value_name = "LIST", default_value = "all")]
    types: String,

    /// JSON catalog snapshot describing the primary's relations.
    #[arg(long, value_name = "FILE")]
    catalog: PathBuf,

    /// JSON replication status file (checkpoint position + stream states).
    #[arg(long, value_name = "FILE")]
    status: PathBuf,

    /// Command run to force a checkpoint on the primary before each
    /// status read. Without it the status file is trusted as-is.
    #[arg(long = "checkpoint-cmd", value_name = "CMD")]
    checkpoint_cmd: Option<String>,

    /// Seconds to wait for the mirror to apply a checkpoint.
    #[arg(
        long = "sync-timeout-secs",
        value_name = "SECS",
        default_value_t = 600,
        value_parser = clap::value_parser!(u64).range(1..=86_400)
    )]
    sync_timeout_secs: u64,

    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

fn run(cli: &Cli) -> Result<bool> {
    // The selection is validated before any filesystem work; a bad list
    // must reject the whole call up front.
    let selection = CategorySelection::parse(&cli.types)?;

    let catalog = JsonCatalog::load(&cli.catalog)?;
    let control = CommandControl::new(cli.status.clone(), cli.checkpoint_cmd.clone());

    let mut config = AuditConfig::new(&cli.primary, &cli.mirror, &cli.database, selection);
    config.sync_timeout = Duration::from_secs(cli.sync_timeout_secs);

    let auditor = ReplicaAuditor::new(config, &catalog, &control);
    let outcome = auditor.run()?;

    outcome.print();
    Ok(outcome.consistent)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            if let Some(AuditError::InvalidParameter(reason)) = err.downcast_ref::<AuditError>() {
                eprintln!("error: invalid relation type selection: {}", reason);
            } else {
                eprintln!("error: {:#}", err);
            }
            ExitCode::from(2)
        }
    }
}
