//! Normalizer CLI
//!
//! Usage:
//! - `normalizer run --manifest config/sources.json --output data/districts.json`
//! - `normalizer inspect "raw/2019 CMAS ELA and Math.xlsx" --rows 5`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use normalizer::config::Settings;
use normalizer::output::SourceStatus;
use normalizer::pipeline::{run, RunOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "normalizer", about = "Normalizes spreadsheet exports into per-entity time series")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every manifest source and write the merged aggregate
    Run {
        /// Path to sources manifest (JSON)
        #[arg(long)]
        manifest: PathBuf,

        /// Output JSON path
        #[arg(long)]
        output: PathBuf,

        /// Complement-pair tolerance (overrides NORMALIZER_TOLERANCE and the manifest)
        #[arg(long)]
        tolerance: Option<f64>,

        /// Write a JSON run report (sources, findings) to this path
        #[arg(long)]
        report: Option<PathBuf>,

        /// Sources read in parallel (overrides NORMALIZER_JOBS)
        #[arg(long)]
        jobs: Option<usize>,
    },

    /// Show sheets, the located header row and the first data rows of a file
    Inspect {
        file: PathBuf,

        /// Data rows to print
        #[arg(long, default_value = "10")]
        rows: usize,

        /// Header marker tokens (repeatable)
        #[arg(long = "marker")]
        markers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    execute(args.command).await
}

async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Run {
            manifest,
            output,
            tolerance,
            report,
            jobs,
        } => {
            // Only `run` reads NORMALIZER_* settings
            let settings = Settings::from_env()?;
            let options = RunOptions {
                manifest,
                output,
                report,
                tolerance: tolerance.or(settings.tolerance),
                jobs: jobs.unwrap_or(settings.jobs),
            };
            let report = run(options).await?;
            let failed = report.count(SourceStatus::Failed);
            if failed > 0 {
                tracing::warn!(failed, "Some sources failed; see the run report for details");
            }
        }
        Command::Inspect { file, rows, markers } => {
            normalizer::inspect::inspect(&file, rows, &markers)
                .with_context(|| format!("Failed to inspect {}", file.display()))?;
        }
    }

    Ok(())
}
