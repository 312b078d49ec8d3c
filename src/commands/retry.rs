use anyhow::Result;

use crate::commands::CommandReport;
use crate::engine::checkpoint::CheckpointStore;
use crate::engine::paths::resolve_paths;
use crate::error::CheckpointError;

/// Put a failed window back to pending so the next `gazette run` retries it.
pub fn run(window_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("retry");
    let paths = resolve_paths()?;
    let checkpoints = CheckpointStore::open(&paths);

    match checkpoints.reset(window_id) {
        Ok(record) => {
            crate::engine::audit::append_event(&paths, "retry", "ok", &record.window_id)?;
            report.detail(format!("window {} reset to pending", record.window_id));
            report.detail("run `gazette run <input>` to reprocess it".to_string());
        }
        Err(err) => {
            if let Some(CheckpointError::AlreadyInProgress { holder_pid, .. }) =
                err.downcast_ref::<CheckpointError>()
            {
                report.issue(format!(
                    "window {window_id} is held by live pid {holder_pid}; wait for that run or stop it first"
                ));
            } else {
                report.issue(format!("could not reset {window_id}: {err}"));
            }
        }
    }

    Ok(report)
}
