//! `target-redshift`: a Singer target loading into Amazon Redshift.
//!
//! Reads protocol messages on stdin and writes checkpoints on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use redshift_config::shared::TargetConfig;
use redshift_config::{load_config, load_config_from_file};
use redshift_telemetry::tracing::init_tracing;
use tracing::info;

use crate::core::start_target;
use crate::error::TargetResult;

mod core;
mod error;

#[derive(Debug, Parser)]
#[command(name = "target-redshift", version, about = "Loads a Singer stream into Amazon Redshift")]
struct Args {
    /// Configuration file (JSON or YAML). Without it `configuration/base.*` and
    /// `configuration/{APP_ENVIRONMENT}.*` are loaded.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", err.render_report());
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> TargetResult<()> {
    let config: TargetConfig = match &args.config {
        Some(path) => load_config_from_file(path)?,
        None => load_config()?,
    };

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    let summary = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_target(config))?;

    info!(
        messages = summary.messages,
        records = summary.records,
        rejected_records = summary.rejected_records,
        batches = summary.batches,
        rows_loaded = summary.rows_loaded,
        checkpoints = summary.checkpoints,
        "run completed"
    );

    Ok(())
}
