//! Per-run report files under `<reports_dir>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cardsync_core::TypeRunStatus;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::coordinator::CycleSummary;
use crate::stats::{OverallStatus, TypeRunStats};

pub const SUMMARY_FILE: &str = "import_summary.json";
pub const BRIEF_FILE: &str = "daily_brief.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub trigger: String,
    pub overall_status: OverallStatus,
    pub summary: CycleSummary,
    pub stats: Vec<TypeRunStats>,
}

pub async fn write_run_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing import summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    fs::write(run_dir.join(BRIEF_FILE), brief_markdown(report))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    Ok(run_dir)
}

fn brief_markdown(report: &RunReport) -> String {
    let summary = &report.summary;
    let mut lines = vec![
        "# Card Import Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Trigger: {}", report.trigger),
        format!("- Status: {:?}", report.overall_status),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Types: {} attempted, {} succeeded, {} failed, {} not attempted",
            summary.attempted, summary.succeeded, summary.failed, summary.skipped
        ),
        format!("- Records imported: {}", summary.imported),
    ];
    if summary.lease_lost {
        lines.push("- Stopped early: the import lock could not be renewed".to_string());
    }
    lines.push(String::new());
    lines.push("## Per Game".to_string());

    for type_report in &summary.reports {
        let line = match type_report.status {
            TypeRunStatus::NotAttempted => format!("- {}: not attempted", type_report.game),
            _ => format!(
                "- {} ({}): {:?}, {} imported ({} new, {} updated), {} failed{}",
                type_report.game,
                type_report.mode,
                type_report.status,
                type_report.counts.imported,
                type_report.counts.inserted,
                type_report.counts.updated,
                type_report.counts.failed,
                type_report
                    .reason
                    .as_deref()
                    .map(|r| format!(" - {r}"))
                    .unwrap_or_default()
            ),
        };
        lines.push(line);
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown listing of the newest `runs` reports.
pub fn report_recent_runs(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Card Imports".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join(SUMMARY_FILE);
        if !summary_path.exists() {
            continue;
        }
        let report: RunReport = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", report.summary.run_id));
        lines.push(format!("- trigger: {}", report.trigger));
        lines.push(format!("- status: {:?}", report.overall_status));
        lines.push(format!("- finished: {}", report.summary.finished_at));
        lines.push(format!("- imported: {}", report.summary.imported));
        let failed: Vec<String> = report
            .summary
            .reports
            .iter()
            .filter(|r| r.status == TypeRunStatus::Failed)
            .map(|r| r.game.to_string())
            .collect();
        if !failed.is_empty() {
            lines.push(format!("- failed: {}", failed.join(", ")));
        }
        lines.push(format!("- summary: `{}`", summary_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
