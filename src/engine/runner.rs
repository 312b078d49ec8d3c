use crate::engine::audit;
use crate::engine::checkpoint::CheckpointStore;
use crate::engine::config::GazetteConfig;
use crate::engine::generate::{
    GenerationRequest, Generator, effective_budget_tokens, estimate_tokens, generate_with_retry,
    resolve_generator,
};
use crate::engine::paths::GazettePaths;
use crate::engine::privacy::{PrivacyPass, PrivacyPolicy, seal_messages};
use crate::engine::sink::{Artifact, OutputSink};
use crate::engine::store::{Message, load_messages, message_bytes};
use crate::engine::tasks::{TaskExecutor, TaskKind, TaskPool, TaskQueue, TaskRecord};
use crate::engine::util::{CancelFlag, now_epoch_secs};
use crate::engine::warn::{self, WarnEvent};
use crate::engine::window::{Window, WindowPolicy, make_windows, split_window};
use crate::error::{CheckpointError, GenerateError, WindowError};
use anyhow::{Context, Result, anyhow};
use chrono::DateTime;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub windows_total: usize,
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub contended: usize,
    pub splits: usize,
    pub tasks_done: usize,
    pub tasks_failed: usize,
}

enum WindowResult {
    Committed { artifact_ref: String },
    Failed,
}

/// Crash-injection hook for resume testing: `GAZETTE_CRASH_AFTER=<stage>:<window_id>`
/// kills the process with exit code 21 right after that stage completes for
/// that window. Stages: `generated`, `persisted`.
fn crash_hook() -> Option<(String, String)> {
    let raw = env::var("GAZETTE_CRASH_AFTER").ok()?;
    let (stage, window_id) = raw.trim().split_once(':')?;
    Some((stage.to_string(), window_id.to_string()))
}

fn maybe_crash(hook: &Option<(String, String)>, stage: &str, window_id: &str) {
    if let Some((hook_stage, hook_window)) = hook
        && hook_stage == stage
        && hook_window == window_id
    {
        eprintln!("GAZETTE_CRASH_AFTER tripped at {stage}:{window_id}");
        std::process::exit(21);
    }
}

fn banner_date(end_epoch_secs: i64) -> String {
    DateTime::from_timestamp(end_epoch_secs, 0)
        .map(|dt| dt.date_naive().to_string())
        .unwrap_or_else(|| "unknown-date".to_string())
}

fn extract_links(messages: &[&Message]) -> Vec<String> {
    let mut links = Vec::new();
    for message in messages {
        for token in message.text.split_whitespace() {
            if token.starts_with("http://") || token.starts_with("https://") {
                let link = token.trim_end_matches([',', '.', ')', ']']).to_string();
                if !links.contains(&link) {
                    links.push(link);
                }
            }
        }
    }
    links
}

/// Executes background tasks against the artifacts tree. Each kind writes
/// its own side output; the digest artifacts themselves are never touched
/// from here.
pub struct EngineTaskExecutor {
    paths: GazettePaths,
}

impl EngineTaskExecutor {
    pub fn new(paths: GazettePaths) -> Self {
        Self { paths }
    }

    fn write_side_output(&self, sub_dir: &str, file_name: &str, body: &str) -> Result<()> {
        let dir = self.paths.artifacts_dir.join(sub_dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(file_name);
        fs::write(&path, body)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

impl TaskExecutor for EngineTaskExecutor {
    fn execute(&self, task: &TaskRecord) -> Result<()> {
        match task.kind {
            TaskKind::Enrich => {
                let window_id = task.payload["window_id"]
                    .as_str()
                    .ok_or_else(|| anyhow!("enrich task missing window_id"))?;
                let links: Vec<&str> = task.payload["links"]
                    .as_array()
                    .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
                    .unwrap_or_default();

                let mut body = format!("# Enrichment for {window_id}\n\n");
                if links.is_empty() {
                    body.push_str("No shared links in this window.\n");
                } else {
                    for link in links {
                        body.push_str(&format!("- {link}\n"));
                    }
                }
                self.write_side_output("enrichment", &format!("{window_id}.md"), &body)
            }
            TaskKind::ProfileRefresh => {
                let author = task.payload["author"]
                    .as_str()
                    .ok_or_else(|| anyhow!("profile task missing author"))?;
                let message_count = task.payload["message_count"].as_u64().unwrap_or(0);
                let last_seen = task.payload["last_seen_epoch_secs"].as_i64().unwrap_or(0);

                let body = format!(
                    "# Profile {author}\n\n- messages_in_last_window: {message_count}\n- last_seen_epoch_secs: {last_seen}\n"
                );
                self.write_side_output("profiles", &format!("{author}.md"), &body)
            }
            TaskKind::AssetRender => {
                let date = task.payload["date"]
                    .as_str()
                    .ok_or_else(|| anyhow!("asset task missing date"))?;
                let window_ids: Vec<&str> = task.payload["window_ids"]
                    .as_array()
                    .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
                    .unwrap_or_default();

                let mut body = format!("# Banner {date}\n\nWindows covered:\n");
                for id in window_ids {
                    body.push_str(&format!("- {id}\n"));
                }
                self.write_side_output("banners", &format!("{date}.md"), &body)
            }
        }
    }
}

struct RunContext<'a> {
    config: &'a GazetteConfig,
    window_policy: WindowPolicy,
    paths: &'a GazettePaths,
    checkpoints: CheckpointStore,
    sink: OutputSink,
    queue: TaskQueue,
    generator: Box<dyn Generator>,
    pass: PrivacyPass,
    messages_by_id: BTreeMap<String, Message>,
    emitted_ids: BTreeSet<String>,
    cancel: CancelFlag,
    crash_hook: Option<(String, String)>,
    outcome: RunOutcome,
}

impl RunContext<'_> {
    fn project(&self, window: &Window) -> Result<Vec<Message>> {
        window
            .message_ids
            .iter()
            .map(|id| {
                self.messages_by_id
                    .get(id)
                    .cloned()
                    .ok_or_else(|| anyhow!("window {} references unknown message {id}", window.window_id))
            })
            .collect()
    }

    fn mark_emitted(&mut self, window: &Window) {
        self.emitted_ids
            .extend(window.message_ids.iter().cloned());
    }

    fn enqueue_window_tasks(&mut self, window: &Window, messages: &[Message]) -> Result<()> {
        let refs: Vec<&Message> = messages.iter().collect();
        let mut links = extract_links(&refs);
        for message in messages {
            for attachment in &message.attachment_refs {
                if !links.contains(attachment) {
                    links.push(attachment.clone());
                }
            }
        }
        self.queue.enqueue(
            TaskKind::Enrich,
            &format!("window:{}", window.window_id),
            serde_json::json!({
                "window_id": window.window_id,
                "links": links,
            }),
        )?;

        let mut per_author: BTreeMap<&str, (u64, i64)> = BTreeMap::new();
        for message in messages {
            let entry = per_author.entry(message.author.as_str()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.max(message.timestamp);
        }
        for (author, (count, last_seen)) in per_author {
            self.queue.enqueue(
                TaskKind::ProfileRefresh,
                &format!("author:{author}"),
                serde_json::json!({
                    "author": author,
                    "message_count": count,
                    "last_seen_epoch_secs": last_seen,
                }),
            )?;
        }

        let date = banner_date(window.end_epoch_secs);
        self.queue.enqueue(
            TaskKind::AssetRender,
            &format!("banner:{date}"),
            serde_json::json!({
                "date": date,
                "window_ids": [window.window_id],
            }),
        )?;
        Ok(())
    }

    /// Process one window to a terminal state. Oversized windows bisect and
    /// recurse; the parent's claim is held until every descendant commits,
    /// so a crash mid-split resumes into the same subdivision.
    fn process_window(&mut self, window: &Window) -> Result<WindowResult> {
        let fingerprint = window.fingerprint(&self.config.pipeline.producer_version);

        if self.checkpoints.is_done(&window.window_id, &fingerprint)? {
            self.outcome.skipped += 1;
            self.mark_emitted(window);
            return Ok(WindowResult::Committed {
                artifact_ref: self.sink.artifact_path(&window.window_id).display().to_string(),
            });
        }

        let ticket = match self.checkpoints.begin(&window.window_id, &fingerprint) {
            Ok(ticket) => ticket,
            Err(err) => match err.downcast_ref::<CheckpointError>() {
                Some(CheckpointError::AlreadyInProgress { holder_pid, .. }) => {
                    warn::emit(WarnEvent {
                        code: "window_contended",
                        stage: "checkpoint",
                        target: &window.window_id,
                        reason: "another live process holds this window",
                        err: &format!("pid_{holder_pid}"),
                    });
                    self.outcome.contended += 1;
                    return Ok(WindowResult::Failed);
                }
                Some(CheckpointError::RequiresRetry { reason, .. }) => {
                    // Failed is terminal: the window stays failed across
                    // reruns until the operator resets it.
                    warn::emit(WarnEvent {
                        code: "window_requires_retry",
                        stage: "checkpoint",
                        target: &window.window_id,
                        reason: "window failed previously; not re-attempted",
                        err: reason,
                    });
                    self.outcome.failed += 1;
                    return Ok(WindowResult::Failed);
                }
                _ => return Err(err),
            },
        };

        if self.cancel.is_cancelled() {
            self.checkpoints.release(ticket)?;
            return Ok(WindowResult::Failed);
        }

        let messages = self.project(window)?;

        // Windows over the byte ceiling are split up front; the generation
        // call would only confirm what the cap already knows.
        let window_bytes: u64 = messages.iter().map(message_bytes).sum();
        if window_bytes > self.window_policy.max_bytes_per_window {
            let estimated = estimate_tokens(&messages, &self.config.generation);
            let budget = effective_budget_tokens(&self.config.generation);
            return self.split_and_recurse(window, ticket, estimated, budget);
        }

        let request = GenerationRequest {
            window_id: &window.window_id,
            messages: &messages,
        };

        let content = match generate_with_retry(
            self.generator.as_ref(),
            &request,
            &self.pass,
            &self.config.generation,
            &self.cancel,
        ) {
            Ok(content) => content,
            Err(GenerateError::TooLarge {
                estimated_tokens,
                effective_budget,
            }) => {
                return self.split_and_recurse(window, ticket, estimated_tokens, effective_budget);
            }
            Err(err) => {
                if self.cancel.is_cancelled() {
                    // Cancellation is not a verdict on the window.
                    self.checkpoints.release(ticket)?;
                    return Ok(WindowResult::Failed);
                }
                let reason = err.to_string();
                self.checkpoints.fail(ticket, &reason)?;
                audit::append_event(self.paths, "generate", "failed", &reason)?;
                warn::emit(WarnEvent {
                    code: "window_failed",
                    stage: "generate",
                    target: &window.window_id,
                    reason: "generation did not produce a digest",
                    err: &reason,
                });
                self.outcome.failed += 1;
                return Ok(WindowResult::Failed);
            }
        };
        maybe_crash(&self.crash_hook, "generated", &window.window_id);

        let fresh_message_ids: Vec<String> = window
            .message_ids
            .iter()
            .filter(|id| !self.emitted_ids.contains(*id))
            .cloned()
            .collect();
        let artifact = Artifact {
            window_id: window.window_id.clone(),
            fingerprint: fingerprint.clone(),
            start_epoch_secs: window.start_epoch_secs,
            end_epoch_secs: window.end_epoch_secs,
            content,
            message_ids: window.message_ids.clone(),
            fresh_message_ids,
            parent_window_id: window.parent_window_id.clone(),
            split_depth: window.split_depth,
        };
        let artifact_ref = self.sink.commit(&artifact)?;
        maybe_crash(&self.crash_hook, "persisted", &window.window_id);

        // Tasks first, checkpoint last: a crash in between re-enqueues on
        // resume and the coalescing key collapses the duplicates.
        self.enqueue_window_tasks(window, &messages)?;
        self.checkpoints
            .commit(ticket, &self.config.pipeline.producer_version, &artifact_ref)?;
        self.mark_emitted(window);
        audit::append_event(self.paths, "window", "committed", &window.window_id)?;
        self.outcome.committed += 1;
        Ok(WindowResult::Committed { artifact_ref })
    }

    fn split_and_recurse(
        &mut self,
        window: &Window,
        ticket: crate::engine::checkpoint::Ticket,
        estimated_tokens: u64,
        effective_budget: u64,
    ) -> Result<WindowResult> {
        let (left, right) = match split_window(window, self.window_policy.max_split_depth) {
            Ok(halves) => halves,
            Err(WindowError::TooLarge { window_id, reason }) => {
                let detail = format!(
                    "~{estimated_tokens} tokens against budget {effective_budget}; {reason}"
                );
                self.checkpoints.fail(ticket, &detail)?;
                audit::append_event(self.paths, "split", "failed", &window_id)?;
                warn::emit(WarnEvent {
                    code: "window_unsplittable",
                    stage: "split",
                    target: &window_id,
                    reason: "window cannot shrink below the budget",
                    err: &detail,
                });
                self.outcome.failed += 1;
                return Ok(WindowResult::Failed);
            }
        };

        self.outcome.splits += 1;
        audit::append_event(self.paths, "split", "started", &window.window_id)?;

        for child in [&left, &right] {
            let refined = self.refine_bounds(child)?;
            if let WindowResult::Failed = self.process_window(&refined)? {
                if self.cancel.is_cancelled() {
                    // A cancelled child was released, not failed; give the
                    // parent claim back the same way.
                    self.checkpoints.release(ticket)?;
                    return Ok(WindowResult::Failed);
                }
                self.checkpoints.fail(
                    ticket,
                    &format!("descendant window {} failed", refined.window_id),
                )?;
                self.outcome.failed += 1;
                return Ok(WindowResult::Failed);
            }
        }

        // The parent window publishes no digest of its own; its checkpoint
        // records the subdivision so resume treats it as done.
        let split_ref = format!("split:{},{}", left.window_id, right.window_id);
        self.checkpoints
            .commit(ticket, &self.config.pipeline.producer_version, &split_ref)?;
        Ok(WindowResult::Committed {
            artifact_ref: split_ref,
        })
    }

    /// Split children inherit the parent's time bounds; tighten them to the
    /// messages they actually carry.
    fn refine_bounds(&self, window: &Window) -> Result<Window> {
        let messages = self.project(window)?;
        let mut refined = window.clone();
        refined.start_epoch_secs = messages.first().map(|m| m.timestamp).unwrap_or(0);
        refined.end_epoch_secs = messages.last().map(|m| m.timestamp).unwrap_or(0);
        Ok(refined)
    }
}

/// End-to-end pipeline: load, seal, window, then drive every window to a
/// terminal state in plan order while the worker pool drains derived tasks.
pub fn run_pipeline(
    config: &GazetteConfig,
    paths: &GazettePaths,
    input_path: &Path,
    cancel: CancelFlag,
) -> Result<RunOutcome> {
    let generator = resolve_generator(&config.generation)?;
    run_pipeline_with(config, paths, input_path, cancel, generator)
}

pub(crate) fn run_pipeline_with(
    config: &GazetteConfig,
    paths: &GazettePaths,
    input_path: &Path,
    cancel: CancelFlag,
    generator: Box<dyn Generator>,
) -> Result<RunOutcome> {
    let run_id = format!("run-{}-{}", now_epoch_secs()?, std::process::id());
    audit::append_event(paths, "run", "started", &run_id)?;

    let messages = load_messages(input_path)?;
    let policy = PrivacyPolicy::new(&config.privacy.tenant, &config.privacy.source)
        .map_err(|err| anyhow!("privacy gate refused the run: {err}"))?;
    let batch = seal_messages(&policy, &run_id, messages)
        .map_err(|err| anyhow!("privacy gate refused the run: {err}"))?;
    audit::append_event(
        paths,
        "seal",
        "ok",
        &format!("{} pseudonyms issued", batch.pseudonym_count),
    )?;

    let window_policy = WindowPolicy {
        step_size: config.windowing.step_size,
        step_unit: FromStr::from_str(&config.windowing.step_unit)?,
        overlap_ratio: config.windowing.overlap_ratio,
        max_bytes_per_window: config.windowing.max_bytes_per_window,
        max_split_depth: config.windowing.max_split_depth,
    };
    let windows = make_windows(&batch.messages, &window_policy);
    audit::append_event(paths, "generate", "provider", generator.label())?;

    let queue = TaskQueue::open(paths);
    let recovered = queue.recover_stale_running()?;
    if recovered > 0 {
        audit::append_event(
            paths,
            "tasks",
            "recovered",
            &format!("{recovered} stale running task(s) requeued"),
        )?;
    }
    let executor = Arc::new(EngineTaskExecutor::new(paths.clone()));
    let pool = TaskPool::start(
        queue.clone(),
        executor,
        config.tasks.workers,
        cancel.clone(),
    );

    let mut ctx = RunContext {
        config,
        window_policy,
        paths,
        checkpoints: CheckpointStore::open(paths),
        sink: OutputSink::open(paths),
        queue,
        generator,
        pass: batch.pass,
        messages_by_id: batch
            .messages
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect(),
        emitted_ids: BTreeSet::new(),
        cancel,
        crash_hook: crash_hook(),
        outcome: RunOutcome {
            run_id: run_id.clone(),
            windows_total: windows.len(),
            ..RunOutcome::default()
        },
    };

    for window in &windows {
        if ctx.cancel.is_cancelled() {
            break;
        }
        // Window failures are recorded and the plan keeps moving; only
        // infrastructure errors (state tables, filesystem) abort the run.
        let _ = ctx.process_window(window)?;
    }

    let drain = pool.finish()?;
    ctx.outcome.tasks_done = drain.done;
    ctx.outcome.tasks_failed = drain.failed;

    let blocking_failures: Vec<&TaskKind> = drain
        .failed_kinds
        .iter()
        .filter(|kind| {
            config
                .tasks
                .blocking_kinds
                .iter()
                .any(|name| name == kind.as_str())
        })
        .collect();
    if !blocking_failures.is_empty() {
        let names: Vec<&str> = blocking_failures.iter().map(|k| k.as_str()).collect();
        audit::append_event(paths, "run", "failed", &run_id)?;
        return Err(anyhow!(
            "blocking background tasks failed: {}",
            names.join(", ")
        ));
    }

    audit::append_event(paths, "run", "finished", &run_id)?;
    Ok(ctx.outcome)
}
