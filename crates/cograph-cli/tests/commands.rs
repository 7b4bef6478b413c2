use std::fs;
use std::path::{Path, PathBuf};

use cograph_cli::cli::{AggregateArgs, Commands, IngestArgs, ReportArgs, SessionizeArgs};
use cograph_cli::run_command;
use cograph_config::{CographConfig, ensure_workspace_config};
use serde_json::Value;
use tempfile::tempdir;

fn run_json(
    workspace: &Path,
    config: &CographConfig,
    command: Commands,
) -> Result<Value, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    run_command(workspace, config, command, &mut out)?;
    Ok(serde_json::from_slice(&out)?)
}

fn aggregate_args() -> AggregateArgs {
    AggregateArgs {
        batch_size: None,
        skip_sessions: 0,
        all: false,
        resume: false,
        max_calls: None,
    }
}

#[test]
fn ingest_then_aggregate_then_report() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let workspace = temp.path();
    let config = ensure_workspace_config(workspace)?;
    assert!(workspace.join(".cograph/config.toml").exists());

    let batch_path = workspace.join("batch.json");
    fs::write(
        &batch_path,
        r#"[
            {"session_id": 1, "item_id": "A", "next_item_id": "B"},
            {"session_id": 1, "item_id": "B", "next_item_id": "C"},
            {"session_id": 2, "item_id": "A", "next_item_id": "B"},
            {"session_id": 2, "next_item_id": "B"}
        ]"#,
    )?;

    let ingest = run_json(
        workspace,
        &config,
        Commands::Ingest(IngestArgs {
            input: batch_path,
            chunk_size: Some(2),
        }),
    )?;
    assert_eq!(ingest["rows_applied"], 3);
    assert_eq!(ingest["rows_skipped"], 1);
    assert_eq!(ingest["skipped"][0]["reason"], "missing_item_id");
    assert_eq!(ingest["chunks_committed"], 2);

    let aggregate = run_json(workspace, &config, Commands::Aggregate(aggregate_args()))?;
    assert_eq!(aggregate["sessions_processed"], 2);
    assert_eq!(aggregate["complete"], true);

    let report = run_json(workspace, &config, Commands::Report(ReportArgs { top: 1 }))?;
    assert_eq!(report["summary"]["items"], 3);
    assert_eq!(report["summary"]["co_occurs_weight"], 4);
    assert_eq!(report["top_co_occurs"].as_array().map(Vec::len), Some(1));
    assert_eq!(report["top_co_occurs"][0]["item_a"], "A");
    assert_eq!(report["top_co_occurs"][0]["item_b"], "B");
    assert_eq!(report["top_co_occurs"][0]["weight"], 2);
    assert_eq!(report["top_next"][0]["from_item"], "A");
    assert_eq!(report["top_next"][0]["session_count"], 2);
    Ok(())
}

#[test]
fn full_pass_reports_cursor_and_resumes() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let workspace = temp.path();
    let config = ensure_workspace_config(workspace)?;

    let rows = (0..5)
        .map(|idx| format!(r#"{{"session_id": "S{idx}", "item_id": "A", "next_item_id": "B"}}"#))
        .collect::<Vec<_>>()
        .join(",");
    let batch_path = workspace.join("batch.json");
    fs::write(&batch_path, format!("[{rows}]"))?;
    run_json(
        workspace,
        &config,
        Commands::Ingest(IngestArgs {
            input: batch_path,
            chunk_size: None,
        }),
    )?;

    let paused = run_json(
        workspace,
        &config,
        Commands::Aggregate(AggregateArgs {
            batch_size: Some(2),
            all: true,
            max_calls: Some(1),
            ..aggregate_args()
        }),
    )?;
    assert_eq!(paused["complete"], false);
    assert_eq!(paused["next_skip"], 2);

    let resumed = run_json(
        workspace,
        &config,
        Commands::Aggregate(AggregateArgs {
            batch_size: Some(2),
            all: true,
            resume: true,
            ..aggregate_args()
        }),
    )?;
    assert_eq!(resumed["started_at_skip"], 2);
    assert_eq!(resumed["sessions_processed"], 3);
    assert_eq!(resumed["complete"], true);
    assert_eq!(resumed["passes_completed"], 1);

    let check = run_json(workspace, &config, Commands::Check)?;
    assert_eq!(check["ok"], true);
    assert_eq!(check["summary"]["sessions_aggregated"], 5);
    assert_eq!(check["aggregation_state"]["next_skip"], 0);
    Ok(())
}

#[test]
fn sessionize_writes_an_ingestable_batch() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let workspace = temp.path();
    let config = ensure_workspace_config(workspace)?;

    let clicks_path = workspace.join("clicks.dat");
    fs::write(
        &clicks_path,
        "\
1,2014-04-07T10:51:09.277Z,214536502,0
1,2014-04-07T10:54:09.868Z,214536500,0
2,2014-04-07T13:56:37.614Z,214536502,0
2,2014-04-07T13:57:19.373Z,214536500,0
2,broken,214536500,0
",
    )?;
    let output: PathBuf = workspace.join("out/batch.json");

    let summary = run_json(
        workspace,
        &config,
        Commands::Sessionize(SessionizeArgs {
            input: clicks_path,
            output: output.clone(),
            min_session_length: None,
            min_item_freq: Some(2),
        }),
    )?;
    assert_eq!(summary["malformed_rows"], 1);
    assert_eq!(summary["report"]["events_out"], 4);
    assert_eq!(summary["report"]["sessions_out"], 2);

    let ingest = run_json(
        workspace,
        &config,
        Commands::Ingest(IngestArgs {
            input: output,
            chunk_size: None,
        }),
    )?;
    assert_eq!(ingest["rows_applied"], 4);
    assert_eq!(ingest["counters"]["next_created"], 1);
    assert_eq!(ingest["counters"]["next_updated"], 1);
    Ok(())
}

#[test]
fn missing_batch_file_is_reported_with_its_path() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let workspace = temp.path();
    let config = ensure_workspace_config(workspace)?;

    let mut out = Vec::new();
    let err = run_command(
        workspace,
        &config,
        Commands::Ingest(IngestArgs {
            input: workspace.join("absent.json"),
            chunk_size: None,
        }),
        &mut out,
    )
    .expect_err("missing input should fail");

    assert!(err.to_string().contains("absent.json"));
    assert!(out.is_empty());
    Ok(())
}
