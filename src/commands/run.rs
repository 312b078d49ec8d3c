use anyhow::{Context, Result};
use std::path::Path;

use crate::commands::CommandReport;
use crate::engine::config::load_config;
use crate::engine::paths::resolve_paths;
use crate::engine::runner::run_pipeline;
use crate::engine::util::CancelFlag;
use crate::engine::warn::{self, WarnEvent};

pub fn run(input: &Path) -> Result<CommandReport> {
    let mut report = CommandReport::new("run");
    let config = load_config()?;
    let paths = resolve_paths()?;

    if !input.is_file() {
        report.issue(format!("input export not found: {}", input.display()));
        return Ok(report);
    }

    // Ctrl-C releases claims instead of leaving them failed: the loop and
    // the worker pool both poll this flag between work units.
    let cancel = CancelFlag::default();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        warn::emit(WarnEvent {
            code: "run_interrupted",
            stage: "run",
            target: "current_run",
            reason: "interrupt received; finishing the current window then stopping",
            err: "signal",
        });
        handler_flag.cancel();
    })
    .context("failed to install interrupt handler")?;

    let outcome = run_pipeline(&config, &paths, input, cancel)?;

    report.detail(format!("run_id={}", outcome.run_id));
    report.detail(format!("windows_total={}", outcome.windows_total));
    report.detail(format!("committed={}", outcome.committed));
    report.detail(format!("skipped={}", outcome.skipped));
    report.detail(format!("splits={}", outcome.splits));
    report.detail(format!("tasks_done={}", outcome.tasks_done));
    report.detail(format!("artifacts_dir={}", paths.artifacts_dir.display()));

    if outcome.failed > 0 {
        report.issue(format!(
            "{} window(s) failed; run `gazette retry <window_id>` after fixing the cause",
            outcome.failed
        ));
    }
    if outcome.contended > 0 {
        report.issue(format!(
            "{} window(s) were held by another live run",
            outcome.contended
        ));
    }
    if outcome.tasks_failed > 0 {
        report.issue(format!(
            "{} background task(s) failed (non-blocking)",
            outcome.tasks_failed
        ));
    }

    Ok(report)
}
