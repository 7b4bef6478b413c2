use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use cograph_config::CographConfig;

pub mod build;
pub mod cli;
pub mod logging;
pub mod report;

use cli::Commands;

pub fn run_command(
    workspace: &Path,
    config: &CographConfig,
    command: Commands,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Ingest(args) => build::run_ingest_command(workspace, config, args, out),
        Commands::Aggregate(args) => build::run_aggregate_command(workspace, config, args, out),
        Commands::Sessionize(args) => build::run_sessionize_command(config, args, out),
        Commands::Report(args) => report::run_report_command(workspace, config, args, out),
        Commands::Check => report::run_check_command(workspace, config, out),
    }
}

pub(crate) fn write_json(out: &mut dyn Write, value: &serde_json::Value) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value).context("failed to serialize JSON output")?;
    writeln!(out).context("failed to write trailing newline")?;
    Ok(())
}
