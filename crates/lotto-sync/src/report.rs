//! Per-run JSON reports and the markdown digest built from them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lotto_core::IngestionRun;
use tokio::fs;
use tracing::warn;

pub const REPORT_FILE: &str = "ingestion_run.json";

/// Write `{reports_dir}/{run_id}/ingestion_run.json`.
pub async fn write_report(reports_dir: &Path, run: &IngestionRun) -> Result<PathBuf> {
    let dir = reports_dir.join(run.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(REPORT_FILE);
    let bytes = serde_json::to_vec_pretty(run).context("serializing ingestion run")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// The `limit` most recent runs, newest first. Unreadable reports are skipped.
pub fn load_recent_runs(reports_dir: &Path, limit: usize) -> Result<Vec<IngestionRun>> {
    if !reports_dir.exists() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path().join(REPORT_FILE);
        if !path.is_file() {
            continue;
        }
        let parsed = std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice::<IngestionRun>(&bytes).map_err(Into::into));
        match parsed {
            Ok(run) => runs.push(run),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run report"),
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);
    Ok(runs)
}

pub fn report_markdown(runs: &[IngestionRun]) -> String {
    let mut lines = vec!["# Draw ingestion runs".to_string(), String::new()];
    if runs.is_empty() {
        lines.push("_no runs recorded_".to_string());
        return lines.join("\n");
    }
    for run in runs {
        lines.push(format!(
            "## {} `{}`",
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.run_id
        ));
        lines.push(format!(
            "- outcome: {:?} (exit {})",
            run.outcome,
            run.exit_code()
        ));
        if let Some(reason) = &run.skipped {
            lines.push(format!("- skipped: {reason}"));
        }
        lines.push(format!(
            "- rows: fetched {}, inserted {}, updated {}",
            run.rows_fetched, run.rows_inserted, run.rows_updated
        ));
        if let Some(source) = &run.source_used {
            lines.push(format!("- source: {source}"));
        }
        if let Some(latest) = run.latest_draw_id {
            lines.push(format!("- latest draw: {latest}"));
        }
        if let Some(counter) = run.consecutive_no_new_draws {
            lines.push(format!("- runs without new draws: {counter}"));
        }
        if !run.divergent_draw_ids.is_empty() {
            lines.push(format!("- divergent draws: {:?}", run.divergent_draw_ids));
        }
        if !run.missing_draw_ids.is_empty() {
            lines.push(format!("- missing draws: {:?}", run.missing_draw_ids));
        }
        for dispatch in &run.notifications {
            lines.push(format!(
                "- {} notification: delivered {:?}, failed {:?}",
                dispatch.kind, dispatch.result.delivered, dispatch.result.failed
            ));
        }
        if let Some(failure) = &run.failure {
            lines.push(format!("- failure ({:?}): {}", failure.kind, failure.message));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}
