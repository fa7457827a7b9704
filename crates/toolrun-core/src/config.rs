//! Configuration resolution for toolrun.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/toolrun/settings.json)
//! 3. Project config (.toolrun/settings.json)
//! 4. Environment variables (highest priority)
//!
//! Components never read the environment themselves; the embedding
//! application resolves a [`Config`] once and hands the relevant sections
//! to the executor, limiter and job manager.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete toolrun configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    /// Per-tool concurrency limits, registered into the limiter at startup.
    #[serde(default)]
    pub limits: HashMap<String, ConcurrencyConfig>,
    /// Default tracing filter handed to `init_tracing` (e.g. `toolrun_exec=debug`).
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Process tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Directory for stdout/stderr capture files (system temp dir when unset).
    pub temp_dir: Option<PathBuf>,
    /// How long completed results stay queryable (seconds).
    pub completed_ttl_secs: u64,
    /// Interval between background cache sweeps (seconds).
    pub cleanup_interval_secs: u64,
    /// Maximum number of completed results kept in memory.
    pub max_completed: usize,
    /// Grace period between SIGTERM and SIGKILL when terminating (seconds).
    pub terminate_grace_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            completed_ttl_secs: 3600,
            cleanup_interval_secs: 300,
            max_completed: 100,
            terminate_grace_secs: 5,
        }
    }
}

/// Job manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Capacity of the job admission semaphore.
    pub max_concurrent_jobs: usize,
    /// Overall timeout applied to each job's execution (seconds).
    pub job_timeout_secs: u64,
    /// How long stored job results stay retrievable without access (seconds).
    pub result_ttl_secs: u64,
    /// Interval between result store sweeps (seconds).
    pub sweep_interval_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            job_timeout_secs: 300,
            result_ttl_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// Per-tool concurrency limit.
///
/// `max_concurrent = 0` is a valid "always closed" configuration.
/// A missing `wait_timeout_secs` means callers are rejected immediately
/// when the limit is reached instead of being held for a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_concurrent: u32,
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            wait_timeout_secs: None,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".toolrun").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    // Apply environment overrides
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".toolrun").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/toolrun/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("toolrun").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.executor.temp_dir.is_some() {
        base.executor.temp_dir = overlay.executor.temp_dir;
    }
    base.executor.completed_ttl_secs = overlay.executor.completed_ttl_secs;
    base.executor.cleanup_interval_secs = overlay.executor.cleanup_interval_secs;
    base.executor.max_completed = overlay.executor.max_completed;
    base.executor.terminate_grace_secs = overlay.executor.terminate_grace_secs;

    base.jobs = overlay.jobs;

    // Per-tool limits merge key-wise; overlay wins on collisions.
    base.limits.extend(overlay.limits);

    if overlay.log_level.is_some() {
        base.log_level = overlay.log_level;
    }
}

fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

/// Apply environment-style overrides from any string lookup.
fn apply_overrides(config: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(n) = get("TOOLRUN_MAX_JOBS").and_then(|v| v.parse().ok()) {
        config.jobs.max_concurrent_jobs = n;
    }
    if let Some(n) = get("TOOLRUN_JOB_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.jobs.job_timeout_secs = n;
    }
    if let Some(dir) = get("TOOLRUN_TEMP_DIR") {
        config.executor.temp_dir = Some(PathBuf::from(dir));
    }
    if let Some(level) = get("TOOLRUN_LOG_LEVEL") {
        config.log_level = Some(level);
    }
}
