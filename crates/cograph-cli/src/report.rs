use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use cograph_build::open_store;
use cograph_config::{CographConfig, config_path, validate_config};
use cograph_store::GraphStore;
use serde_json::json;

use crate::cli::ReportArgs;
use crate::write_json;

pub fn run_report_command(
    workspace: &Path,
    config: &CographConfig,
    args: ReportArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let store = open_store(workspace, &config.storage).context("failed to open graph store")?;
    let top = args.top.clamp(1, 200);

    let summary = store.graph_summary().context("summary query failed")?;
    let items = store
        .top_items_by_contains(top)
        .context("item degree query failed")?;
    let co_occurs = store
        .top_co_occurs(top)
        .context("co-occurrence query failed")?;
    let next = store.top_next(top).context("transition query failed")?;

    let response = json!({
        "summary": summary,
        "top_items_by_contains": items,
        "top_co_occurs": co_occurs,
        "top_next": next,
    });
    write_json(out, &response)
}

pub fn run_check_command(
    workspace: &Path,
    config: &CographConfig,
    out: &mut dyn Write,
) -> Result<()> {
    let store = open_store(workspace, &config.storage).context("failed to open graph store")?;
    store.ping().context("graph store connectivity probe failed")?;

    let summary = store.graph_summary().context("summary query failed")?;
    let aggregation = store
        .get_aggregation_state()
        .context("aggregation state query failed")?;
    let warnings = validate_config(config)
        .into_iter()
        .map(|warning| json!({ "code": warning.code, "message": warning.message }))
        .collect::<Vec<_>>();

    tracing::info!(db = %store.db_path().display(), "graph store ready");

    let response = json!({
        "ok": true,
        "workspace": workspace.display().to_string(),
        "cograph_dir": store.cograph_dir().display().to_string(),
        "db_path": store.db_path().display().to_string(),
        "config_path": config_path(workspace).display().to_string(),
        "summary": summary,
        "aggregation_state": aggregation,
        "config_warnings": warnings,
    });
    write_json(out, &response)
}
