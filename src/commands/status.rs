use anyhow::Result;

use crate::commands::CommandReport;
use crate::engine::checkpoint::{CheckpointStore, WindowStatus};
use crate::engine::paths::resolve_paths;
use crate::engine::tasks::TaskQueue;

fn status_label(status: WindowStatus) -> &'static str {
    match status {
        WindowStatus::Pending => "pending",
        WindowStatus::InProgress => "in_progress",
        WindowStatus::Committed => "committed",
        WindowStatus::Failed => "failed",
    }
}

pub fn run(limit: usize) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let paths = resolve_paths()?;

    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!("state_dir={}", paths.state_dir.display()));
    report.detail(format!("artifacts_dir={}", paths.artifacts_dir.display()));

    let checkpoints = CheckpointStore::open(&paths);
    let mut rows = checkpoints.list()?;
    rows.sort_by(|a, b| b.updated_at_epoch_secs.cmp(&a.updated_at_epoch_secs));

    let mut committed = 0usize;
    let mut failed = 0usize;
    let mut in_progress = 0usize;
    for row in &rows {
        match row.status {
            WindowStatus::Committed => committed += 1,
            WindowStatus::Failed => failed += 1,
            WindowStatus::InProgress => in_progress += 1,
            WindowStatus::Pending => {}
        }
    }
    report.detail(format!(
        "windows: total={} committed={committed} failed={failed} in_progress={in_progress}",
        rows.len()
    ));

    for row in rows.iter().take(limit) {
        let mut line = format!("{} {}", row.window_id, status_label(row.status));
        if let Some(artifact_ref) = &row.artifact_ref {
            line.push_str(&format!(" -> {artifact_ref}"));
        }
        if let Some(error) = &row.error {
            line.push_str(&format!(" ({error})"));
        }
        report.detail(line);
    }

    let queue = TaskQueue::open(&paths);
    let backlog = queue.backlog_by_kind()?;
    if backlog.is_empty() {
        report.detail("task backlog: empty".to_string());
    } else {
        for (kind, count) in backlog {
            report.detail(format!("task backlog: {}={count}", kind.as_str()));
        }
    }

    if failed > 0 {
        report.issue(format!("{failed} window(s) in failed state"));
    }

    Ok(report)
}
