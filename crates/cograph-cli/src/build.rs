use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use cograph_build::{
    AggregateRequest, CoOccurrenceAggregator, IngestOptions, Ingestor, PassRequest,
    SessionizeOptions, open_store, read_click_events, read_interaction_batch, sessionize,
};
use cograph_config::CographConfig;
use cograph_core::InteractionRow;
use serde_json::json;

use crate::cli::{AggregateArgs, IngestArgs, SessionizeArgs};
use crate::write_json;

pub fn run_ingest_command(
    workspace: &Path,
    config: &CographConfig,
    args: IngestArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let rows = read_batch_input(&args.input)?;

    let mut options = IngestOptions::from_config(&config.ingest);
    if let Some(chunk_size) = args.chunk_size {
        options.chunk_size = chunk_size.max(1);
    }

    let store = open_store(workspace, &config.storage).context("failed to open graph store")?;
    let mut ingestor = Ingestor::new(store, options);
    let result = ingestor.ingest(&rows).context("ingest failed")?;

    let response = serde_json::to_value(result).context("failed to serialize ingest output")?;
    write_json(out, &response)
}

pub fn run_aggregate_command(
    workspace: &Path,
    config: &CographConfig,
    args: AggregateArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let batch_size = args.batch_size.unwrap_or(config.aggregate.batch_size);
    let store = open_store(workspace, &config.storage).context("failed to open graph store")?;
    let mut aggregator = CoOccurrenceAggregator::new(store, &config.aggregate);

    let response = if args.all {
        let result = aggregator
            .run_pass(PassRequest {
                batch_size,
                resume: args.resume,
                max_calls: args.max_calls,
            })
            .context("co-occurrence pass failed")?;
        serde_json::to_value(result).context("failed to serialize pass output")?
    } else {
        let result = aggregator
            .aggregate(AggregateRequest {
                batch_size,
                skip_sessions: args.skip_sessions,
            })
            .context("co-occurrence aggregation failed")?;
        serde_json::to_value(result).context("failed to serialize aggregate output")?
    };

    write_json(out, &response)
}

pub fn run_sessionize_command(
    config: &CographConfig,
    args: SessionizeArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let file = File::open(&args.input)
        .with_context(|| format!("failed to open click log {}", args.input.display()))?;
    let log = read_click_events(BufReader::new(file)).context("failed to read click log")?;

    let mut options = SessionizeOptions::from_config(&config.sessionize);
    if let Some(min_session_length) = args.min_session_length {
        options.min_session_length = min_session_length;
    }
    if let Some(min_item_freq) = args.min_item_freq {
        options.min_item_freq = min_item_freq.max(1);
    }

    let sessionized = sessionize(log.events, options);

    if is_stdio(&args.output) {
        serde_json::to_writer(&mut *out, &sessionized.rows)
            .context("failed to write interaction batch")?;
        writeln!(out).context("failed to write trailing newline")?;
        return Ok(());
    }

    write_batch_file(&args.output, &sessionized.rows)?;
    let response = json!({
        "output": args.output.display().to_string(),
        "malformed_rows": log.malformed_rows,
        "report": sessionized.report,
    });
    write_json(out, &response)
}

fn read_batch_input(input: &Path) -> Result<Vec<InteractionRow>> {
    if is_stdio(input) {
        let stdin = std::io::stdin();
        return read_interaction_batch(stdin.lock()).context("failed to parse batch from stdin");
    }

    let file = File::open(input)
        .with_context(|| format!("failed to open batch file {}", input.display()))?;
    read_interaction_batch(BufReader::new(file))
        .with_context(|| format!("failed to parse batch file {}", input.display()))
}

fn write_batch_file(path: &Path, rows: &[InteractionRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, rows).context("failed to write interaction batch")?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;

    tracing::info!(path = %path.display(), rows = rows.len(), "wrote interaction batch");
    Ok(())
}

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}
