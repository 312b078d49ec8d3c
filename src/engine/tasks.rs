use crate::engine::paths::GazettePaths;
use crate::engine::table::{read_table, with_exclusive_table};
use crate::engine::util::{CancelFlag, now_epoch_secs};
use crate::engine::warn::{self, WarnEvent};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Superseded,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Enrich,
    ProfileRefresh,
    AssetRender,
}

impl TaskKind {
    /// Higher runs first. Asset renders gate what readers see immediately,
    /// profile refreshes feed the next run, enrichment is best-effort.
    pub fn priority(self) -> u8 {
        match self {
            TaskKind::AssetRender => 8,
            TaskKind::ProfileRefresh => 5,
            TaskKind::Enrich => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Enrich => "enrich",
            TaskKind::ProfileRefresh => "profile_refresh",
            TaskKind::AssetRender => "asset_render",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: TaskKind,
    /// Coalescing key. A newly queued task supersedes every still-queued
    /// task with the same kind and target.
    pub target_key: String,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(default)]
    pub claimed_by_pid: Option<u32>,
    pub superseded_by: Option<String>,
    pub error: Option<String>,
    pub created_at_epoch_secs: u64,
    pub updated_at_epoch_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct TaskTable {
    next_seq: u64,
    tasks: BTreeMap<String, TaskRecord>,
}

#[derive(Debug, Clone)]
pub struct TaskQueue {
    table_path: PathBuf,
}

impl TaskQueue {
    pub fn open(paths: &GazettePaths) -> Self {
        Self {
            table_path: paths.state_dir.join("tasks.json"),
        }
    }

    /// Queue a task, superseding any still-queued duplicates for the same
    /// kind and target in the same locked transaction. Running tasks are
    /// never superseded; they already hold their inputs.
    pub fn enqueue(
        &self,
        kind: TaskKind,
        target_key: &str,
        payload: serde_json::Value,
    ) -> Result<TaskRecord> {
        let target_key = target_key.to_string();
        with_exclusive_table::<TaskTable, TaskRecord>(&self.table_path, |table| {
            let now = now_epoch_secs()?;
            let task_id = format!("t{:06}", table.next_seq);
            table.next_seq += 1;

            for older in table.tasks.values_mut() {
                if older.state == TaskState::Queued
                    && older.kind == kind
                    && older.target_key == target_key
                {
                    older.state = TaskState::Superseded;
                    older.superseded_by = Some(task_id.clone());
                    older.updated_at_epoch_secs = now;
                }
            }

            let record = TaskRecord {
                task_id: task_id.clone(),
                kind,
                target_key: target_key.clone(),
                payload: payload.clone(),
                state: TaskState::Queued,
                attempts: 0,
                claimed_by_pid: None,
                superseded_by: None,
                error: None,
                created_at_epoch_secs: now,
                updated_at_epoch_secs: now,
            };
            table.tasks.insert(task_id, record.clone());
            Ok(record)
        })
    }

    /// Claim the highest-priority queued task, oldest first within a
    /// priority. The claim flips the row to running inside the table lock,
    /// so two workers can never pick the same task.
    pub fn claim_next(&self) -> Result<Option<TaskRecord>> {
        with_exclusive_table::<TaskTable, Option<TaskRecord>>(&self.table_path, |table| {
            let next_id = table
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Queued)
                .max_by(|a, b| {
                    a.kind
                        .priority()
                        .cmp(&b.kind.priority())
                        // BTreeMap iterates in id order, so the later task
                        // wins a max_by tie; reverse to prefer the older id.
                        .then(b.task_id.cmp(&a.task_id))
                })
                .map(|t| t.task_id.clone());

            let Some(task_id) = next_id else {
                return Ok(None);
            };
            let record = table.tasks.get_mut(&task_id).expect("claimed id exists");
            record.state = TaskState::Running;
            record.attempts += 1;
            record.claimed_by_pid = Some(std::process::id());
            record.updated_at_epoch_secs = now_epoch_secs()?;
            Ok(Some(record.clone()))
        })
    }

    pub fn complete(&self, task_id: &str) -> Result<()> {
        self.finish_task(task_id, TaskState::Done, None)
    }

    pub fn fail(&self, task_id: &str, error: &str) -> Result<()> {
        self.finish_task(task_id, TaskState::Failed, Some(error.to_string()))
    }

    fn finish_task(&self, task_id: &str, state: TaskState, error: Option<String>) -> Result<()> {
        let task_id = task_id.to_string();
        with_exclusive_table::<TaskTable, ()>(&self.table_path, |table| {
            let record = table
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| anyhow::anyhow!("unknown task {task_id}"))?;
            record.state = state;
            record.error = error.clone();
            record.claimed_by_pid = None;
            record.updated_at_epoch_secs = now_epoch_secs()?;
            Ok(())
        })
    }

    /// Requeue running tasks whose claiming process died. Called once at
    /// run start, before any worker claims anything.
    pub fn recover_stale_running(&self) -> Result<usize> {
        with_exclusive_table::<TaskTable, usize>(&self.table_path, |table| {
            let now = now_epoch_secs()?;
            let mut recovered = 0;
            for task in table.tasks.values_mut() {
                if task.state != TaskState::Running {
                    continue;
                }
                let holder = task.claimed_by_pid.unwrap_or(0);
                if holder == 0 || !crate::engine::util::pid_alive(holder) {
                    task.state = TaskState::Queued;
                    task.claimed_by_pid = None;
                    task.updated_at_epoch_secs = now;
                    recovered += 1;
                }
            }
            Ok(recovered)
        })
    }

    pub fn list(&self) -> Result<Vec<TaskRecord>> {
        let table: TaskTable = read_table(&self.table_path)?;
        Ok(table.tasks.into_values().collect())
    }

    pub fn backlog_by_kind(&self) -> Result<BTreeMap<TaskKind, usize>> {
        let mut out = BTreeMap::new();
        for task in self.list()? {
            if task.state == TaskState::Queued || task.state == TaskState::Running {
                *out.entry(task.kind).or_insert(0) += 1;
            }
        }
        Ok(out)
    }
}

/// Side-effect half of a task. The pool owns scheduling; implementors only
/// see one claimed task at a time.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &TaskRecord) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct DrainOutcome {
    pub done: usize,
    pub failed: usize,
    pub failed_kinds: Vec<TaskKind>,
}

pub struct TaskPool {
    queue: TaskQueue,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawn `workers` threads that drain the queue while the main loop
    /// keeps producing. Workers exit once `finish` is called and the queue
    /// is empty, or immediately on cancellation.
    pub fn start(
        queue: TaskQueue,
        executor: Arc<dyn TaskExecutor>,
        workers: u64,
        cancel: CancelFlag,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers as usize);
        for _ in 0..workers {
            let queue = queue.clone();
            let executor = Arc::clone(&executor);
            let stop = Arc::clone(&stop);
            let cancel = cancel.clone();
            handles.push(thread::spawn(move || {
                worker_loop(&queue, executor.as_ref(), &stop, &cancel);
            }));
        }
        Self {
            queue,
            stop,
            workers: handles,
        }
    }

    /// Signal no more tasks are coming, wait for the drain, and summarize.
    pub fn finish(self) -> Result<DrainOutcome> {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.workers {
            if handle.join().is_err() {
                warn::emit(WarnEvent {
                    code: "task_worker_panicked",
                    stage: "tasks",
                    target: "pool",
                    reason: "worker thread panicked",
                    err: "join_error",
                });
            }
        }

        let mut outcome = DrainOutcome::default();
        for task in self.queue.list()? {
            match task.state {
                TaskState::Done => outcome.done += 1,
                TaskState::Failed => {
                    outcome.failed += 1;
                    if !outcome.failed_kinds.contains(&task.kind) {
                        outcome.failed_kinds.push(task.kind);
                    }
                }
                _ => {}
            }
        }
        Ok(outcome)
    }
}

fn worker_loop(
    queue: &TaskQueue,
    executor: &dyn TaskExecutor,
    stop: &AtomicBool,
    cancel: &CancelFlag,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let claimed = match queue.claim_next() {
            Ok(claimed) => claimed,
            Err(err) => {
                warn::emit(WarnEvent {
                    code: "task_claim_failed",
                    stage: "tasks",
                    target: "queue",
                    reason: "could not read task table",
                    err: &err.to_string(),
                });
                return;
            }
        };

        let Some(task) = claimed else {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(25));
            continue;
        };

        let result = executor.execute(&task);
        let bookkeeping = match result {
            Ok(()) => queue.complete(&task.task_id),
            Err(err) => queue.fail(&task.task_id, &err.to_string()),
        };
        if let Err(err) = bookkeeping {
            warn::emit(WarnEvent {
                code: "task_bookkeeping_failed",
                stage: "tasks",
                target: &task.task_id,
                reason: "could not record task outcome",
                err: &err.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DrainOutcome, TaskExecutor, TaskKind, TaskPool, TaskQueue, TaskRecord, TaskState};
    use crate::engine::paths::GazettePaths;
    use crate::engine::util::CancelFlag;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn test_queue(root: &std::path::Path) -> TaskQueue {
        TaskQueue::open(&GazettePaths {
            home: root.to_path_buf(),
            state_dir: root.join("state"),
            artifacts_dir: root.join("artifacts"),
            logs_dir: root.join("logs"),
        })
    }

    #[test]
    fn enqueue_supersedes_queued_duplicates_only() {
        let dir = tempdir().expect("tempdir");
        let queue = test_queue(dir.path());

        let first = queue
            .enqueue(TaskKind::ProfileRefresh, "author:p-aa", json!({}))
            .expect("enqueue");
        let second = queue
            .enqueue(TaskKind::ProfileRefresh, "author:p-aa", json!({}))
            .expect("enqueue");
        // Same target, different kind: untouched.
        queue
            .enqueue(TaskKind::Enrich, "author:p-aa", json!({}))
            .expect("enqueue");

        let tasks = queue.list().expect("list");
        let state_of = |id: &str| tasks.iter().find(|t| t.task_id == id).unwrap().state;
        assert_eq!(state_of(&first.task_id), TaskState::Superseded);
        assert_eq!(state_of(&second.task_id), TaskState::Queued);

        let first_row = tasks.iter().find(|t| t.task_id == first.task_id).unwrap();
        assert_eq!(first_row.superseded_by.as_deref(), Some(second.task_id.as_str()));

        let queued = tasks.iter().filter(|t| t.state == TaskState::Queued).count();
        assert_eq!(queued, 2);
    }

    #[test]
    fn claim_prefers_priority_then_age() {
        let dir = tempdir().expect("tempdir");
        let queue = test_queue(dir.path());

        queue.enqueue(TaskKind::Enrich, "w0000", json!({})).expect("enqueue");
        queue
            .enqueue(TaskKind::AssetRender, "banner:2024-01-02", json!({}))
            .expect("enqueue");
        queue
            .enqueue(TaskKind::AssetRender, "banner:2024-01-03", json!({}))
            .expect("enqueue");

        let first = queue.claim_next().expect("claim").expect("task");
        assert_eq!(first.kind, TaskKind::AssetRender);
        assert_eq!(first.target_key, "banner:2024-01-02");

        let second = queue.claim_next().expect("claim").expect("task");
        assert_eq!(second.target_key, "banner:2024-01-03");

        let third = queue.claim_next().expect("claim").expect("task");
        assert_eq!(third.kind, TaskKind::Enrich);
        assert!(queue.claim_next().expect("claim").is_none());
    }

    #[test]
    fn superseded_tasks_are_never_claimed() {
        let dir = tempdir().expect("tempdir");
        let queue = test_queue(dir.path());

        queue
            .enqueue(TaskKind::Enrich, "w0000", json!({"rev": 1}))
            .expect("enqueue");
        queue
            .enqueue(TaskKind::Enrich, "w0000", json!({"rev": 2}))
            .expect("enqueue");

        let claimed = queue.claim_next().expect("claim").expect("task");
        assert_eq!(claimed.payload["rev"], 2);
        assert!(queue.claim_next().expect("claim").is_none());
    }

    struct CountingExecutor {
        executed: AtomicUsize,
    }

    impl TaskExecutor for CountingExecutor {
        fn execute(&self, task: &TaskRecord) -> anyhow::Result<()> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if task.target_key == "poison" {
                anyhow::bail!("simulated task failure");
            }
            Ok(())
        }
    }

    #[test]
    fn pool_drains_queue_and_reports_failures() {
        let dir = tempdir().expect("tempdir");
        let queue = test_queue(dir.path());

        for i in 0..5 {
            queue
                .enqueue(TaskKind::Enrich, &format!("w{i:04}"), json!({}))
                .expect("enqueue");
        }
        queue
            .enqueue(TaskKind::AssetRender, "poison", json!({}))
            .expect("enqueue");

        let executor = Arc::new(CountingExecutor {
            executed: AtomicUsize::new(0),
        });
        let pool = TaskPool::start(queue.clone(), executor.clone(), 2, CancelFlag::default());
        let DrainOutcome {
            done,
            failed,
            failed_kinds,
        } = pool.finish().expect("finish");

        assert_eq!(done, 5);
        assert_eq!(failed, 1);
        assert_eq!(failed_kinds, vec![TaskKind::AssetRender]);
        assert_eq!(executor.executed.load(Ordering::SeqCst), 6);
    }
}
