use anyhow::Result;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Return the current Unix epoch in seconds.
///
/// This is the single, canonical implementation — **do not** duplicate
/// this helper in other modules.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn pid_alive(pid: u32) -> bool {
    if cfg!(windows) {
        // Checkpoint rows carry the holder pid only as a staleness hint;
        // on Windows we treat every recorded holder as alive and rely on
        // the operator retry command to clear wedged rows.
        true
    } else {
        let Ok(status) = Command::new("kill").arg("-0").arg(pid.to_string()).status() else {
            return false;
        };
        status.success()
    }
}

/// Cooperative cancellation flag shared between the orchestration loop and
/// the background worker pool. Checked between retries and between work
/// units, never mid-side-effect.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
