//! CLI entrypoint for the portsync conformance harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use portsync_harness::{contract_matrix, emit_json, run_conformance};
use tracing_subscriber::EnvFilter;

/// Conformance tooling for portsync.
#[derive(Debug, Parser)]
#[command(name = "portsync-harness")]
#[command(about = "Conformance harness for portsync mutexes and condition variables")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the behavioral scenarios against the native backend.
    Conformance {
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Duration requested by the timed-wait scenario, in milliseconds.
        #[arg(long, default_value_t = 50)]
        timeout_ms: u64,
    },
    /// Print the mutex transition contract matrix.
    Contract {
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Conformance { output, timeout_ms } => {
            let report = run_conformance(timeout_ms);
            emit_json(&report, output.as_deref())?;
            eprintln!(
                "portsync conformance: {} passed, {} failed ({} backend)",
                report.passed, report.failed, report.backend
            );
            if !report.ok {
                std::process::exit(1);
            }
        }
        Command::Contract { output } => {
            emit_json(&contract_matrix(), output.as_deref())?;
        }
    }

    Ok(())
}
