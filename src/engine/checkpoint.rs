use crate::engine::paths::GazettePaths;
use crate::engine::table::{read_table, with_exclusive_table};
use crate::engine::util::{now_epoch_secs, pid_alive};
use crate::error::CheckpointError;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Pending,
    InProgress,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub window_id: String,
    pub status: WindowStatus,
    pub fingerprint: String,
    pub producer_version: String,
    pub holder_pid: Option<u32>,
    pub committed_at_epoch_secs: Option<u64>,
    pub artifact_ref: Option<String>,
    pub error: Option<String>,
    pub updated_at_epoch_secs: u64,
}

type CheckpointTable = BTreeMap<String, CheckpointRecord>;

/// Single-writer claim on one window. Dropping a ticket without calling
/// `commit`, `fail`, or `release` leaves the row in progress; the stale-pid
/// check reclaims it on the next run.
#[derive(Debug)]
pub struct Ticket {
    pub window_id: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    table_path: PathBuf,
}

impl CheckpointStore {
    pub fn open(paths: &GazettePaths) -> Self {
        Self {
            table_path: paths.state_dir.join("checkpoints.json"),
        }
    }

    /// True when the window is already committed under the same fingerprint.
    /// A committed row with a different fingerprint is treated as stale and
    /// does not count as done.
    pub fn is_done(&self, window_id: &str, fingerprint: &str) -> Result<bool> {
        let table: CheckpointTable = read_table(&self.table_path)?;
        Ok(table.get(window_id).is_some_and(|record| {
            record.status == WindowStatus::Committed && record.fingerprint == fingerprint
        }))
    }

    /// Claim the window for this process. Fails with `AlreadyInProgress`
    /// when another live process holds it, and with `RequiresRetry` when the
    /// window failed before: failed is terminal until `reset` clears it. An
    /// in-progress row whose holder pid is dead is a crash leftover and is
    /// reclaimed here.
    pub fn begin(&self, window_id: &str, fingerprint: &str) -> Result<Ticket> {
        let window_id = window_id.to_string();
        let fingerprint = fingerprint.to_string();
        let pid = std::process::id();

        with_exclusive_table::<CheckpointTable, Ticket>(&self.table_path, |table| {
            if let Some(existing) = table.get(&window_id) {
                if existing.status == WindowStatus::InProgress {
                    let holder = existing.holder_pid.unwrap_or(0);
                    if holder != 0 && holder != pid && pid_alive(holder) {
                        return Err(CheckpointError::AlreadyInProgress {
                            window_id: window_id.clone(),
                            holder_pid: holder,
                        }
                        .into());
                    }
                }
                if existing.status == WindowStatus::Failed {
                    return Err(CheckpointError::RequiresRetry {
                        window_id: window_id.clone(),
                        reason: existing
                            .error
                            .clone()
                            .unwrap_or_else(|| "unrecorded error".to_string()),
                    }
                    .into());
                }
                if existing.status == WindowStatus::Committed
                    && existing.fingerprint == fingerprint
                {
                    return Err(anyhow!(
                        "window {window_id} is already committed; check is_done before begin"
                    ));
                }
            }

            table.insert(
                window_id.clone(),
                CheckpointRecord {
                    window_id: window_id.clone(),
                    status: WindowStatus::InProgress,
                    fingerprint: fingerprint.clone(),
                    producer_version: String::new(),
                    holder_pid: Some(pid),
                    committed_at_epoch_secs: None,
                    artifact_ref: None,
                    error: None,
                    updated_at_epoch_secs: now_epoch_secs()?,
                },
            );
            Ok(Ticket {
                window_id: window_id.clone(),
                fingerprint: fingerprint.clone(),
            })
        })
    }

    pub fn commit(
        &self,
        ticket: Ticket,
        producer_version: &str,
        artifact_ref: &str,
    ) -> Result<()> {
        self.transition(ticket, |record, now| {
            record.status = WindowStatus::Committed;
            record.producer_version = producer_version.to_string();
            record.artifact_ref = Some(artifact_ref.to_string());
            record.committed_at_epoch_secs = Some(now);
            record.error = None;
            record.holder_pid = None;
        })
    }

    pub fn fail(&self, ticket: Ticket, error: &str) -> Result<()> {
        self.transition(ticket, |record, _now| {
            record.status = WindowStatus::Failed;
            record.error = Some(error.to_string());
            record.holder_pid = None;
        })
    }

    /// Give the claim back without recording an outcome, e.g. when the run
    /// is cancelled between claiming and generating.
    pub fn release(&self, ticket: Ticket) -> Result<()> {
        self.transition(ticket, |record, _now| {
            record.status = WindowStatus::Pending;
            record.holder_pid = None;
        })
    }

    fn transition(
        &self,
        ticket: Ticket,
        apply: impl FnOnce(&mut CheckpointRecord, u64),
    ) -> Result<()> {
        with_exclusive_table::<CheckpointTable, ()>(&self.table_path, |table| {
            let record = table.get_mut(&ticket.window_id).ok_or_else(|| {
                anyhow!("checkpoint row for {} vanished mid-claim", ticket.window_id)
            })?;
            if record.fingerprint != ticket.fingerprint {
                return Err(anyhow!(
                    "checkpoint row for {} was rewritten under a different fingerprint",
                    ticket.window_id
                ));
            }
            let now = now_epoch_secs()?;
            apply(record, now);
            record.updated_at_epoch_secs = now;
            Ok(())
        })
    }

    /// Reset a failed window back to pending so the next run retries it.
    /// In-progress rows held by a live process are refused.
    pub fn reset(&self, window_id: &str) -> Result<CheckpointRecord> {
        let window_id = window_id.to_string();
        with_exclusive_table::<CheckpointTable, CheckpointRecord>(&self.table_path, |table| {
            let record = table
                .get_mut(&window_id)
                .ok_or_else(|| anyhow!("no checkpoint recorded for window {window_id}"))?;
            if record.status == WindowStatus::InProgress {
                let holder = record.holder_pid.unwrap_or(0);
                if holder != 0 && pid_alive(holder) {
                    return Err(CheckpointError::AlreadyInProgress {
                        window_id: window_id.clone(),
                        holder_pid: holder,
                    }
                    .into());
                }
            }
            record.status = WindowStatus::Pending;
            record.holder_pid = None;
            record.error = None;
            record.artifact_ref = None;
            record.committed_at_epoch_secs = None;
            record.updated_at_epoch_secs = now_epoch_secs()?;
            Ok(record.clone())
        })
    }

    pub fn list(&self) -> Result<Vec<CheckpointRecord>> {
        let table: CheckpointTable = read_table(&self.table_path)?;
        Ok(table.into_values().collect())
    }
}
