use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const COGRAPH_DIR_NAME: &str = ".cograph";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const GRAPH_DB_FILE_NAME: &str = "graph.sqlite";

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_INGEST_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_INGEST_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_AGGREGATE_BATCH_SIZE: u32 = 10_000;
pub const DEFAULT_MIN_SESSION_LENGTH: usize = 2;
pub const DEFAULT_MIN_ITEM_FREQ: usize = 5;

const LARGE_BATCH_WARNING_THRESHOLD: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CographConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    #[serde(default)]
    pub sessionize: SessionizeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_ingest_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_ingest_chunk_size(),
            max_retries: default_ingest_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateConfig {
    #[serde(default = "default_aggregate_batch_size")]
    pub batch_size: u32,
    /// Marks each session membership once its pairs are counted so a
    /// repeated pass does not count them again.
    #[serde(default = "default_true")]
    pub track_sessions: bool,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            batch_size: default_aggregate_batch_size(),
            track_sessions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionizeConfig {
    #[serde(default = "default_min_session_length")]
    pub min_session_length: usize,
    #[serde(default = "default_min_item_freq")]
    pub min_item_freq: usize,
}

impl Default for SessionizeConfig {
    fn default() -> Self {
        Self {
            min_session_length: default_min_session_length(),
            min_item_freq: default_min_item_freq(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn cograph_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(COGRAPH_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    cograph_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn graph_db_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    cograph_dir(workspace_root).join(GRAPH_DB_FILE_NAME)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<CographConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(CographConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: CographConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<CographConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(cograph_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = CographConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &CographConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.ingest.max_retries == 0 {
        warnings.push(ConfigWarning {
            code: "ingest_retries_disabled",
            message: "ingest.max_retries is 0; a busy database fails the batch immediately"
                .to_owned(),
        });
    }
    if config.aggregate.batch_size > LARGE_BATCH_WARNING_THRESHOLD {
        warnings.push(ConfigWarning {
            code: "aggregate_batch_large",
            message: format!(
                "aggregate.batch_size={} expands pairs for that many sessions in one transaction",
                config.aggregate.batch_size
            ),
        });
    }
    if !config.aggregate.track_sessions {
        warnings.push(ConfigWarning {
            code: "aggregate_untracked",
            message: "aggregate.track_sessions=false; re-running a pass over the same sessions re-counts every pair"
                .to_owned(),
        });
    }
    if config.sessionize.min_session_length < 2 {
        warnings.push(ConfigWarning {
            code: "sessionize_single_event_sessions",
            message: "sessionize.min_session_length < 2 keeps sessions that produce no transitions"
                .to_owned(),
        });
    }

    warnings
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_ingest_chunk_size() -> usize {
    DEFAULT_INGEST_CHUNK_SIZE
}

fn default_ingest_max_retries() -> u32 {
    DEFAULT_INGEST_MAX_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_aggregate_batch_size() -> u32 {
    DEFAULT_AGGREGATE_BATCH_SIZE
}

fn default_min_session_length() -> usize {
    DEFAULT_MIN_SESSION_LENGTH
}

fn default_min_item_freq() -> usize {
    DEFAULT_MIN_ITEM_FREQ
}

fn default_true() -> bool {
    true
}

fn normalize_config(mut config: CographConfig) -> CographConfig {
    if config.storage.busy_timeout_ms == 0 {
        config.storage.busy_timeout_ms = default_busy_timeout_ms();
    }
    if config.ingest.chunk_size == 0 {
        config.ingest.chunk_size = default_ingest_chunk_size();
    }
    if config.aggregate.batch_size == 0 {
        config.aggregate.batch_size = default_aggregate_batch_size();
    }
    config.sessionize.min_item_freq = config.sessionize.min_item_freq.max(1);

    config
}
