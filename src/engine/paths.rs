use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct GazettePaths {
    pub home: PathBuf,
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<GazettePaths> {
    let home_dir = required_home_dir()?;
    let home = env_or_default_path("GAZETTE_HOME", home_dir.join(".gazette"));

    let state_dir = env_or_default_path("GAZETTE_STATE_DIR", home.join("state"));
    let artifacts_dir = env_or_default_path("GAZETTE_ARTIFACTS_DIR", home.join("artifacts"));
    let logs_dir = env_or_default_path("GAZETTE_LOGS_DIR", home.join("logs"));

    Ok(GazettePaths {
        home,
        state_dir,
        artifacts_dir,
        logs_dir,
    })
}
