use crate::engine::paths::GazettePaths;
use crate::engine::util::now_epoch_secs;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// One committed digest plus the provenance a resumed run needs to avoid
/// republishing overlapped messages.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub window_id: String,
    pub fingerprint: String,
    pub start_epoch_secs: i64,
    pub end_epoch_secs: i64,
    pub content: String,
    pub message_ids: Vec<String>,
    /// Ids published here for the first time; overlap carried in from the
    /// previous window is listed in `message_ids` but not here.
    pub fresh_message_ids: Vec<String>,
    pub parent_window_id: Option<String>,
    pub split_depth: u32,
}

#[derive(Debug, Clone)]
pub struct OutputSink {
    artifacts_dir: PathBuf,
}

fn yaml_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn render_artifact(artifact: &Artifact, created_at_epoch_secs: u64) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str("gazette_artifact: 1\n");
    out.push_str(&format!("window_id: {}\n", yaml_quote(&artifact.window_id)));
    out.push_str(&format!("fingerprint: {}\n", yaml_quote(&artifact.fingerprint)));
    if let Some(parent) = &artifact.parent_window_id {
        out.push_str(&format!("parent_window_id: {}\n", yaml_quote(parent)));
    }
    out.push_str(&format!("split_depth: {}\n", artifact.split_depth));
    out.push_str(&format!("start_epoch_secs: {}\n", artifact.start_epoch_secs));
    out.push_str(&format!("end_epoch_secs: {}\n", artifact.end_epoch_secs));
    out.push_str(&format!("created_at_epoch_secs: {created_at_epoch_secs}\n"));
    out.push_str(&format!(
        "message_ids: [{}]\n",
        artifact
            .message_ids
            .iter()
            .map(|id| yaml_quote(id))
            .collect::<Vec<_>>()
            .join(", ")
    ));
    out.push_str(&format!(
        "fresh_message_ids: [{}]\n",
        artifact
            .fresh_message_ids
            .iter()
            .map(|id| yaml_quote(id))
            .collect::<Vec<_>>()
            .join(", ")
    ));
    out.push_str("---\n\n");
    out.push_str(artifact.content.trim_end());
    out.push('\n');
    out
}

impl OutputSink {
    pub fn open(paths: &GazettePaths) -> Self {
        Self {
            artifacts_dir: paths.artifacts_dir.clone(),
        }
    }

    pub fn artifact_path(&self, window_id: &str) -> PathBuf {
        self.artifacts_dir.join(format!("{window_id}.md"))
    }

    /// Persist the artifact and return its path as the checkpoint's
    /// artifact ref. Re-committing the same window is a no-op, so a run
    /// resumed after a crash between persist and checkpoint never writes a
    /// second copy.
    pub fn commit(&self, artifact: &Artifact) -> Result<String> {
        fs::create_dir_all(&self.artifacts_dir)
            .with_context(|| format!("failed to create {}", self.artifacts_dir.display()))?;

        let path = self.artifact_path(&artifact.window_id);
        if path.exists() {
            let existing = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if existing.contains(&format!("fingerprint: {}", yaml_quote(&artifact.fingerprint))) {
                return Ok(path.display().to_string());
            }
        }

        let body = render_artifact(artifact, now_epoch_secs()?);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.artifacts_dir)
            .with_context(|| format!("failed to create temp file in {}", self.artifacts_dir.display()))?;
        use std::io::Write;
        tmp.write_all(body.as_bytes())?;
        tmp.persist(&path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(path.display().to_string())
    }
}
