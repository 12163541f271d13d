//! recompute - batch feature recomputation
//!
//! Rebuilds the feature table from the full event log. Meant to be run by an
//! external scheduler; exits non-zero when the run fails.
//!
//! Usage:
//!   recompute --db outlier_detector.db --window-secs 300

use clap::Parser;
use outlier_core::{Aggregator, BatchPipeline, DetectorConfig, SqliteStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recompute")]
#[command(about = "Recompute rolling features from the event log")]
struct Cli {
    /// SQLite database holding the `logs` and `features` tables
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Window length in seconds
    #[arg(short, long)]
    window_secs: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match DetectorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    let db = cli.db.unwrap_or(config.db_path);
    let window_length = match cli.window_secs {
        Some(0) => {
            error!("--window-secs must be positive");
            return ExitCode::from(2);
        }
        Some(secs) => chrono::Duration::seconds(i64::from(secs)),
        None => config.window_length,
    };

    let store = match SqliteStore::open(&db) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, db = %db.display(), "Failed to open database");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = BatchPipeline::new(store.clone(), store, Aggregator::new(window_length));
    match pipeline.recompute().await {
        Ok(report) => {
            println!(
                "recomputed {} feature vectors for {} entities in {:.2?}",
                report.vectors, report.entities, report.elapsed
            );
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
