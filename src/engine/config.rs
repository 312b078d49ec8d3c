use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowingConfig {
    pub step_size: u64,
    pub step_unit: String,
    pub overlap_ratio: f64,
    pub max_bytes_per_window: u64,
    pub max_split_depth: u32,
}

impl Default for WindowingConfig {
    fn default() -> Self {
        Self {
            step_size: 100,
            step_unit: "messages".to_string(),
            overlap_ratio: 0.2,
            max_bytes_per_window: 320_000,
            max_split_depth: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub provider: String,
    pub model: String,
    pub budget_tokens: u64,
    /// Fraction of `budget_tokens` actually offered to the generation call.
    /// The original pipeline hard-coded `max_tokens * 0.8` with no recorded
    /// derivation; the headroom is surfaced here so operators can tune it.
    pub budget_headroom_ratio: f64,
    /// Rough message-count sizing heuristic used for operator diagnostics
    /// (the companion of the headroom ratio above).
    pub approx_tokens_per_message: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "gemini-2.5-flash-lite".to_string(),
            budget_tokens: 250_000,
            budget_headroom_ratio: 0.8,
            approx_tokens_per_message: 5,
            request_timeout_secs: 45,
            max_retries: 3,
            retry_base_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    pub workers: u64,
    /// Task kinds whose failure fails the run instead of degrading it.
    pub blocking_kinds: Vec<String>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            blocking_kinds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    pub tenant: String,
    pub source: String,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            tenant: "default".to_string(),
            source: "chat-export".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Folded into every window fingerprint; bump to force reprocessing of
    /// previously committed windows.
    pub producer_version: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GazetteConfig {
    pub windowing: WindowingConfig,
    pub generation: GenerationConfig,
    pub tasks: TasksConfig,
    pub privacy: PrivacyConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialGazetteConfig {
    windowing: Option<WindowingConfig>,
    generation: Option<GenerationConfig>,
    tasks: Option<TasksConfig>,
    privacy: Option<PrivacyConfig>,
    pipeline: Option<PipelineConfig>,
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() { fallback.to_vec() } else { out }
        }
        Err(_) => fallback.to_vec(),
    }
}

const VALID_STEP_UNITS: [&str; 4] = ["messages", "hours", "days", "bytes"];
const VALID_TASK_KINDS: [&str; 3] = ["enrich", "profile_refresh", "asset_render"];

fn validate(cfg: &GazetteConfig) -> Result<()> {
    if cfg.windowing.step_size == 0 {
        return Err(anyhow!("invalid step size: must be >= 1"));
    }
    if !VALID_STEP_UNITS.contains(&cfg.windowing.step_unit.as_str()) {
        return Err(anyhow!(
            "invalid step unit `{}`: use messages, hours, days, or bytes",
            cfg.windowing.step_unit
        ));
    }
    let r = cfg.windowing.overlap_ratio;
    if !(0.0..1.0).contains(&r) {
        return Err(anyhow!("invalid overlap ratio: require 0 <= overlap < 1"));
    }
    if cfg.windowing.max_bytes_per_window == 0 {
        return Err(anyhow!("invalid max bytes per window: must be >= 1"));
    }
    if cfg.windowing.max_split_depth == 0 {
        return Err(anyhow!("invalid max split depth: must be >= 1"));
    }
    let h = cfg.generation.budget_headroom_ratio;
    if !(h > 0.0 && h <= 1.0) {
        return Err(anyhow!("invalid budget headroom: require 0 < headroom <= 1"));
    }
    if cfg.generation.budget_tokens == 0 {
        return Err(anyhow!("invalid budget tokens: must be >= 1"));
    }
    if cfg.generation.provider != "local" && cfg.generation.provider != "remote" {
        return Err(anyhow!("invalid generation provider: use `local` or `remote`"));
    }
    if cfg.tasks.workers == 0 {
        return Err(anyhow!("invalid task workers: must be >= 1"));
    }
    for kind in &cfg.tasks.blocking_kinds {
        if !VALID_TASK_KINDS.contains(&kind.as_str()) {
            return Err(anyhow!(
                "invalid blocking task kind `{kind}`: use enrich, profile_refresh, or asset_render"
            ));
        }
    }
    if cfg.privacy.tenant.trim().is_empty() {
        return Err(anyhow!("invalid privacy tenant: cannot be empty"));
    }
    if cfg.privacy.source.trim().is_empty() {
        return Err(anyhow!("invalid privacy source: cannot be empty"));
    }
    if cfg.pipeline.producer_version.trim().is_empty() {
        return Err(anyhow!("invalid producer version: cannot be empty"));
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("GAZETTE_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    if let Ok(home) = env::var("GAZETTE_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed).join("gazette.toml"));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".gazette").join("gazette.toml"))
}

fn merge_file_config(base: &mut GazetteConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialGazetteConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse gazette config {}: {err}", path.display()))?;
    if let Some(windowing) = parsed.windowing {
        base.windowing = windowing;
    }
    if let Some(generation) = parsed.generation {
        base.generation = generation;
    }
    if let Some(tasks) = parsed.tasks {
        base.tasks = tasks;
    }
    if let Some(privacy) = parsed.privacy {
        base.privacy = privacy;
    }
    if let Some(pipeline) = parsed.pipeline {
        base.pipeline = pipeline;
    }
    Ok(())
}

pub fn load_config() -> Result<GazetteConfig> {
    let mut cfg = GazetteConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.windowing.step_size = env_or_u64("GAZETTE_STEP_SIZE", cfg.windowing.step_size);
    cfg.windowing.step_unit = env_or_string("GAZETTE_STEP_UNIT", &cfg.windowing.step_unit);
    cfg.windowing.overlap_ratio = env_or_f64("GAZETTE_OVERLAP_RATIO", cfg.windowing.overlap_ratio);
    cfg.windowing.max_bytes_per_window = env_or_u64(
        "GAZETTE_MAX_BYTES_PER_WINDOW",
        cfg.windowing.max_bytes_per_window,
    );
    cfg.windowing.max_split_depth =
        env_or_u32("GAZETTE_MAX_SPLIT_DEPTH", cfg.windowing.max_split_depth);

    cfg.generation.provider = env_or_string("GAZETTE_PROVIDER", &cfg.generation.provider);
    cfg.generation.model = env_or_string("GAZETTE_MODEL", &cfg.generation.model);
    cfg.generation.budget_tokens = env_or_u64("GAZETTE_BUDGET_TOKENS", cfg.generation.budget_tokens);
    cfg.generation.budget_headroom_ratio = env_or_f64(
        "GAZETTE_BUDGET_HEADROOM_RATIO",
        cfg.generation.budget_headroom_ratio,
    );
    cfg.generation.approx_tokens_per_message = env_or_u64(
        "GAZETTE_APPROX_TOKENS_PER_MESSAGE",
        cfg.generation.approx_tokens_per_message,
    );
    cfg.generation.request_timeout_secs = env_or_u64(
        "GAZETTE_REQUEST_TIMEOUT_SECS",
        cfg.generation.request_timeout_secs,
    );
    cfg.generation.max_retries = env_or_u32("GAZETTE_MAX_RETRIES", cfg.generation.max_retries);
    cfg.generation.retry_base_delay_ms = env_or_u64(
        "GAZETTE_RETRY_BASE_DELAY_MS",
        cfg.generation.retry_base_delay_ms,
    );

    cfg.tasks.workers = env_or_u64("GAZETTE_TASK_WORKERS", cfg.tasks.workers);
    cfg.tasks.blocking_kinds = env_or_csv("GAZETTE_BLOCKING_KINDS", &cfg.tasks.blocking_kinds);

    cfg.privacy.tenant = env_or_string("GAZETTE_TENANT", &cfg.privacy.tenant);
    cfg.privacy.source = env_or_string("GAZETTE_SOURCE", &cfg.privacy.source);

    cfg.pipeline.producer_version =
        env_or_string("GAZETTE_PRODUCER_VERSION", &cfg.pipeline.producer_version);

    validate(&cfg)?;
    Ok(cfg)
}
