//! Layered workspace configuration: built-in defaults, `builder.toml`, `BUILDER_*` env vars.
//!
//! CLI flags are the highest-priority layer but are applied by `builder-cli` after loading
//! this base config, since this crate knows nothing about `clap`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How the cache behaves when it finds an on-disk schema version behind the current binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMismatchPolicy {
    /// Migrate entries in place.
    Migrate,
    /// Discard the entire cache directory and start fresh.
    Purge,
}

/// Retry behavior for transient action failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per action, including the first.
    pub max_attempts: u32,
    /// Initial backoff in milliseconds before the second attempt.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the backoff after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Fully resolved configuration driving a single build invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root of the workspace being built.
    pub workspace_root: PathBuf,
    /// Directory holding the action-cache index and blob store.
    pub cache_dir: PathBuf,
    /// Number of scheduler worker threads; defaults to available parallelism.
    pub worker_count: usize,
    /// Optional remote cache endpoint (`http(s)://...`).
    pub remote_cache_url: Option<String>,
    /// Forces a specific sandbox backend instead of auto-detection.
    pub sandbox_backend: Option<String>,
    /// Retry policy applied by the action runner.
    pub retry: RetryConfig,
    /// Whether to keep building independent branches after a failure.
    pub keep_going: bool,
    /// Policy for an on-disk cache schema behind the current binary.
    pub schema_mismatch_policy: SchemaMismatchPolicy,
    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"builder=debug"`.
    pub log_filter: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        WorkspaceConfig {
            workspace_root: PathBuf::from("."),
            cache_dir: PathBuf::from(".builder-cache"),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            remote_cache_url: None,
            sandbox_backend: None,
            retry: RetryConfig::default(),
            keep_going: false,
            schema_mismatch_policy: SchemaMismatchPolicy::Purge,
            log_filter: "info".to_string(),
        }
    }
}

/// On-disk `builder.toml` shape; every field optional so partial overrides are ergonomic.
#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    cache_dir: Option<PathBuf>,
    worker_count: Option<usize>,
    remote_cache_url: Option<String>,
    sandbox_backend: Option<String>,
    keep_going: Option<bool>,
    log_filter: Option<String>,
    retry_max_attempts: Option<u32>,
    retry_initial_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    retry_backoff_multiplier: Option<f64>,
}

impl WorkspaceConfig {
    /// Loads configuration for `workspace_root`, layering defaults, an optional
    /// `builder.toml` at the workspace root, and `BUILDER_*` environment variables, in
    /// increasing priority. Does not apply CLI flags; callers do that afterward.
    pub fn load(workspace_root: &Path) -> Result<WorkspaceConfig, ConfigError> {
        if !workspace_root.is_dir() {
            return Err(ConfigError::InvalidWorkspaceRoot(
                workspace_root.display().to_string(),
            ));
        }

        let mut config = WorkspaceConfig {
            workspace_root: workspace_root.to_path_buf(),
            ..WorkspaceConfig::default()
        };

        let toml_path = workspace_root.join("builder.toml");
        if toml_path.is_file() {
            let text = std::fs::read_to_string(&toml_path)?;
            let file_config: FileConfig =
                toml::from_str(&text).map_err(|source| ConfigError::TomlParse {
                    path: toml_path.display().to_string(),
                    source,
                })?;
            apply_file_config(&mut config, file_config);
        }

        apply_env(&mut config, &std::env::vars().collect())?;

        Ok(config)
    }
}

fn apply_file_config(config: &mut WorkspaceConfig, file: FileConfig) {
    if let Some(v) = file.cache_dir {
        config.cache_dir = v;
    }
    if let Some(v) = file.worker_count {
        config.worker_count = v;
    }
    if let Some(v) = file.remote_cache_url {
        config.remote_cache_url = Some(v);
    }
    if let Some(v) = file.sandbox_backend {
        config.sandbox_backend = Some(v);
    }
    if let Some(v) = file.keep_going {
        config.keep_going = v;
    }
    if let Some(v) = file.log_filter {
        config.log_filter = v;
    }
    if let Some(v) = file.retry_max_attempts {
        config.retry.max_attempts = v;
    }
    if let Some(v) = file.retry_initial_backoff_ms {
        config.retry.initial_backoff_ms = v;
    }
    if let Some(v) = file.retry_max_backoff_ms {
        config.retry.max_backoff_ms = v;
    }
    if let Some(v) = file.retry_backoff_multiplier {
        config.retry.backoff_multiplier = v;
    }
}

fn apply_env(
    config: &mut WorkspaceConfig,
    vars: &HashMap<String, String>,
) -> Result<(), ConfigError> {
    if let Some(v) = vars.get("BUILDER_CACHE_DIR") {
        config.cache_dir = PathBuf::from(v);
    }
    if let Some(v) = vars.get("BUILDER_WORKER_COUNT") {
        config.worker_count = v
            .parse()
            .map_err(|_| ConfigError::InvalidEnvValue("BUILDER_WORKER_COUNT".into(), v.clone()))?;
    }
    if let Some(v) = vars.get("BUILDER_REMOTE_CACHE_URL") {
        config.remote_cache_url = Some(v.clone());
    }
    if let Some(v) = vars.get("BUILDER_SANDBOX_BACKEND") {
        config.sandbox_backend = Some(v.clone());
    }
    if let Some(v) = vars.get("BUILDER_KEEP_GOING") {
        config.keep_going = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Some(v) = vars.get("BUILDER_LOG") {
        config.log_filter = v.clone();
    }
    Ok(())
}
